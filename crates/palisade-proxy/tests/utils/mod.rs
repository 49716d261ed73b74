use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Context as _, Error};
use palisade_policy::{load_str, Authenticator};
use palisade_proxy::{Proxy, ProxyConfig};

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A scripted stand-in for the protected service.
///
/// Each accepted connection plays the script: read exactly `expected`
/// bytes, record them, send `response`, then either half-close or keep
/// reading. Everything read is recorded, so tests can assert on the
/// exact bytes the shim let through.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<u8>>>,
}

/// Backend that answers `steps` exchanges per connection, then
/// half-closes so the shim relays end-of-stream to the client.
pub fn given_backend(steps: Vec<(usize, Vec<u8>)>) -> Result<MockBackend, Error> {
    spawn_backend(steps, true)
}

/// Backend that answers nothing and records whatever arrives until the
/// shim closes the connection.
pub fn given_sink_backend() -> Result<MockBackend, Error> {
    spawn_backend(Vec::new(), false)
}

fn spawn_backend(steps: Vec<(usize, Vec<u8>)>, half_close: bool) -> Result<MockBackend, Error> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind mock backend")?;
    let addr = listener.local_addr()?;
    let received = Arc::new(Mutex::new(Vec::new()));

    let log = received.clone();
    thread::spawn(move || {
        while let Ok((stream, _)) = listener.accept() {
            let steps = steps.clone();
            let log = log.clone();
            thread::spawn(move || {
                let _ = serve_connection(stream, &steps, half_close, &log);
            });
        }
    });

    Ok(MockBackend { addr, received })
}

fn serve_connection(
    mut stream: TcpStream,
    steps: &[(usize, Vec<u8>)],
    half_close: bool,
    log: &Mutex<Vec<u8>>,
) -> Result<(), Error> {
    stream.set_read_timeout(Some(TEST_TIMEOUT))?;

    for (expected, response) in steps {
        let mut buffer = vec![0u8; *expected];
        stream.read_exact(&mut buffer)?;
        log.lock().unwrap().extend_from_slice(&buffer);
        stream.write_all(response)?;
    }

    if half_close {
        let _ = stream.shutdown(Shutdown::Write);
    }

    // Record stragglers until the shim closes its side
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    log.lock().unwrap().extend_from_slice(&rest);

    Ok(())
}

/// Bind a shim on an ephemeral port in front of `backend` and run its
/// reactor on a background thread.
pub fn given_proxy(
    config_json: &str,
    auth: Box<dyn Authenticator + Send>,
    backend: SocketAddr,
) -> Result<SocketAddr, Error> {
    given_proxy_with_idle(config_json, auth, backend, None)
}

pub fn given_proxy_with_idle(
    config_json: &str,
    auth: Box<dyn Authenticator + Send>,
    backend: SocketAddr,
    idle_timeout: Option<Duration>,
) -> Result<SocketAddr, Error> {
    let table = Arc::new(load_str(config_json)?);

    let mut config = ProxyConfig::new("127.0.0.1:0".parse()?, backend);
    config.idle_timeout = idle_timeout;

    let proxy = Proxy::bind(config, table, auth)?;
    let addr = proxy.local_addr();
    thread::spawn(move || proxy.run());

    Ok(addr)
}

/// Send one payload through the shim and collect everything it sends
/// back until the connection closes.
pub fn when_request(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut stream = TcpStream::connect(addr).context("failed to connect to shim")?;
    stream.set_read_timeout(Some(TEST_TIMEOUT))?;
    stream.write_all(payload)?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .context("shim did not close the connection")?;
    Ok(response)
}

pub fn then_blocked(response: &[u8]) {
    assert!(
        response.starts_with(b"HTTP/1.0 403 Forbidden\r\n"),
        "expected the block response, got: {:?}",
        String::from_utf8_lossy(response)
    );
    assert!(
        response
            .windows(b"Action Not Allowed".len())
            .any(|window| window == b"Action Not Allowed"),
        "block page body missing"
    );
}
