//! Remote API boundary: opaque request specs, the transport seam, and the
//! request executor.

mod executor;
mod transport;

pub use executor::RequestExecutor;
pub use transport::{ApiResponse, HttpTransport, Method, RequestSpec, Transport};
