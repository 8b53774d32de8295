mod signature;

pub use signature::{split_auth_token, AuthValidator};
