//! Manual HTTP/1.1: request framing, head parsing, response writing.

pub mod reader;
pub mod request;
pub mod response;

pub use reader::{find_header_end, read_request};
pub use request::{Headers, HttpRequest, Method, RequestHead};
pub use response::{HttpResponse, reason_phrase};
