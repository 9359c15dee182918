//! HTTP/1.1 request layer over [`reactor`]: strict request parsing
//! (including streaming multipart), per-method routing, static-file
//! mounts, keep-alive budgets, and response serialization.

pub mod mime;
pub mod multipart;
pub mod request;
pub mod response;
pub mod server;

pub use multipart::{FormFile, MultipartError, MultipartParser};
pub use request::{Headers, HttpRequest, ParseError, RequestParser};
pub use response::{HttpResponse, Status};
pub use server::{HttpServer, MountPoint};
