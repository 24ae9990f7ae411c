pub(crate) mod aws_sdk;
