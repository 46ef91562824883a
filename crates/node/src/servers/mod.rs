//! The node's two TCP protocols: calibration handoff and trajectory range
//! queries. Both are one request/response per connection on a trusted local
//! interface, served by cooperative single-threaded loops.

pub mod calibration;
pub mod query;

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;

/// Connections carry at most this many payload bytes.
pub const MAX_PAYLOAD: usize = 4096;

const IO_TIMEOUT: Duration = Duration::from_secs(4);

/// Read one JSON document off a freshly accepted connection. The peer keeps
/// the socket open while waiting for the reply, so reads stop as soon as the
/// accumulated bytes parse (or the payload limit / read timeout trips).
pub(crate) fn read_document<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut payload = Vec::with_capacity(MAX_PAYLOAD);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        payload.extend_from_slice(&chunk[..n]);
        if serde_json::from_slice::<T>(&payload).is_ok() || payload.len() >= MAX_PAYLOAD {
            break;
        }
    }

    serde_json::from_slice(&payload)
        .map_err(|err| anyhow::anyhow!("malformed request document: {err}"))
}
