pub mod http;
pub mod mock;

pub use http::HttpInvoker;
pub use mock::{MockCall, MockInvoker, MockResponse};
