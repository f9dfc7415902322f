pub mod envelope;
pub mod error;
pub mod meta;
pub mod requests;
pub mod responses;


pub use envelope::{DecodeFailure, RequestEnvelope};
pub use error::{GrenacheError, Result};
pub use meta::{Meta, PeerCertificate};
pub use requests::{Payload, Request, RequestId, RequestOptions, ServiceKey};
pub use responses::Reply;
