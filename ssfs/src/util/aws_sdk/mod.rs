//! Glue between the AWS SDK's own async types and the `futures` ecosystem
pub(crate) mod stream;
