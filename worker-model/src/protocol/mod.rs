pub mod endpoint;
pub(crate) mod request;
pub mod response;
pub mod transport;
