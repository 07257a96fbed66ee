//! Dials a [`tonic::transport::Channel`] for a configured upstream: plaintext
//! HTTP/2 or TLS 1.2+ with the platform's native root store, eagerly
//! connected the way `grpcurl`'s own `BlockingDial` does.

use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use groxy_core::error::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn dial(address: &str, tls: bool) -> Result<Channel, Error> {
    let scheme = if tls { "https" } else { "http" };
    let uri = format!("{scheme}://{address}");

    let mut endpoint: Endpoint = Channel::from_shared(uri)
        .map_err(|e| Error::Config(format!("invalid upstream address {address:?}: {e}")))?
        .connect_timeout(CONNECT_TIMEOUT);

    if tls {
        // rustls never negotiates below TLS 1.2, so the minimum version
        // spec.md §6 asks for falls out of `tonic`'s rustls backend for free.
        let tls_config = ClientTlsConfig::new().with_native_roots();
        endpoint = endpoint
            .tls_config(tls_config)
            .map_err(|e| Error::Config(format!("configuring TLS for {address:?}: {e}")))?;
    }

    endpoint
        .connect()
        .await
        .map_err(|e| Error::Config(format!("dialing upstream {address:?}: {e}")))
}
