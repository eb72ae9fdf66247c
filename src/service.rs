use crate::bridge::BridgeModel;
use crate::calibration::{TuneRequest, TuneResponse, TUNE_PATH};
use crate::types::{STANDARD_TUNING, STRING_COUNT};
use log::{debug, info, warn};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const NO_PITCH_DATA: &str = "No pitch data provided";
pub const WRONG_PITCH_COUNT: &str = "Expected 6 string pitches";

/// Refuse request bodies larger than this.
const MAX_BODY: usize = 64 * 1024;
/// Request line plus headers.
const MAX_HEADER: u64 = 8 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Answer one `/tune_guitar` request body.
pub fn tune_guitar(model: &BridgeModel, body: &[u8]) -> TuneResponse {
    let request: TuneRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            debug!("Unusable request body: {}", e);
            return TuneResponse::failure(NO_PITCH_DATA);
        }
    };
    let pitches = match <[f64; STRING_COUNT]>::try_from(request.pitches.as_slice()) {
        Ok(p) => p,
        Err(_) => {
            warn!("Got {} pitches: {:?}", request.pitches.len(), request.pitches);
            return TuneResponse::failure(WRONG_PITCH_COUNT);
        }
    };
    match model.intermediate_targets(&pitches, &STANDARD_TUNING) {
        Ok(targets) => {
            info!("Pitches {:?} -> targets {:?}", pitches, targets);
            TuneResponse::ok(targets)
        }
        Err(e) => {
            warn!("No targets for {:?}: {}", pitches, e);
            TuneResponse::failure(e.to_string())
        }
    }
}

// ─── HTTP plumbing ──────────────────────────────────────────────────────────

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn parse_request(stream: &TcpStream) -> io::Result<HttpRequest> {
    let mut reader = BufReader::new(stream.try_clone()?.take(MAX_HEADER));
    let mut method = String::new();
    let mut path = String::from("/");
    let mut content_length = 0usize;
    let mut first = true;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if !line.ends_with('\n') && reader.get_ref().limit() == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request header too large"));
        }
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if first {
            // "POST /tune_guitar HTTP/1.1"
            let mut parts = trimmed.split_whitespace();
            method = parts.next().unwrap_or_default().to_string();
            if let Some(p) = parts.next() {
                path = p.to_string();
            }
            first = false;
            continue;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad Content-Length"))?;
            }
        }
    }
    if content_length > MAX_BODY {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request body too large"));
    }

    // Whatever of the body is already buffered was read under the header cap.
    let buffered = reader.buffer().len() as u64;
    reader
        .get_mut()
        .set_limit((content_length as u64).saturating_sub(buffered));
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(HttpRequest { method, path, body })
}

fn respond(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let header = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn handle_connection(
    mut stream: TcpStream,
    model: &BridgeModel,
    read_timeout: Duration,
) -> io::Result<()> {
    stream.set_read_timeout(Some(read_timeout))?;
    let req = parse_request(&stream)?;
    debug!("{} {} ({} bytes)", req.method, req.path, req.body.len());
    if req.path != TUNE_PATH {
        return respond(&mut stream, "404 Not Found", "text/plain", b"not found");
    }
    if req.method != "POST" {
        return respond(&mut stream, "405 Method Not Allowed", "text/plain", b"use POST");
    }
    let response = tune_guitar(model, &req.body);
    let json = serde_json::to_vec(&response).map_err(io::Error::other)?;
    respond(&mut stream, "200 OK", "application/json", &json)
}

// ─── Server ─────────────────────────────────────────────────────────────────

/// Reference calibration service: `POST /tune_guitar` backed by the bridge model.
pub struct CalibrationServer {
    listener: TcpListener,
    model: Arc<BridgeModel>,
    read_timeout: Duration,
}

impl CalibrationServer {
    pub fn bind(addr: &str, model: BridgeModel) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            model: Arc::new(model),
            read_timeout: READ_TIMEOUT,
        })
    }

    /// How long a connection may sit idle mid-request before it is dropped.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Blocks the calling thread.
    pub fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Calibration service listening on http://{}{}", addr, TUNE_PATH),
            Err(e) => warn!("Calibration service address unknown: {}", e),
        }
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let model = self.model.clone();
                    let read_timeout = self.read_timeout;
                    let spawned = thread::Builder::new()
                        .name("tune-request".into())
                        .spawn(move || {
                            if let Err(e) = handle_connection(stream, &model, read_timeout) {
                                warn!("Request failed: {}", e);
                            }
                        });
                    if let Err(e) = spawned {
                        warn!("Could not spawn request thread: {}", e);
                    }
                }
                Err(e) => warn!("TCP accept error: {}", e),
            }
        }
    }

    /// Run on a background thread, returning the bound address.
    pub fn spawn(self) -> io::Result<SocketAddr> {
        let addr = self.local_addr()?;
        thread::Builder::new()
            .name("tune-service".into())
            .spawn(move || self.run())?;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn post_header(len: usize) -> String {
        format!(
            "POST /tune_guitar HTTP/1.1\r\nHost: x\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            len
        )
    }

    #[test]
    fn test_missing_pitches() {
        let model = BridgeModel::default();
        let bodies: [&[u8]; 4] = [b"", b"{}", b"not json", br#"{"pitches": "a lot"}"#];
        for body in bodies {
            assert_eq!(tune_guitar(&model, body), TuneResponse::failure(NO_PITCH_DATA));
        }
    }

    #[test]
    fn test_wrong_count() {
        let model = BridgeModel::default();
        let resp = tune_guitar(&model, br#"{"pitches": [330, 247, 196]}"#);
        assert_eq!(resp, TuneResponse::failure(WRONG_PITCH_COUNT));
    }

    #[test]
    fn test_tuned_guitar_gets_reference_targets() {
        let model = BridgeModel::fitted();
        let body = serde_json::to_vec(&TuneRequest {
            pitches: STANDARD_TUNING.to_vec(),
        })
        .unwrap();
        let targets = tune_guitar(&model, &body).into_targets().unwrap();
        for (t, s) in targets.iter().zip(STANDARD_TUNING.iter()) {
            assert!((t - s).abs() < 1e-6);
        }
    }

    #[test]
    fn test_drifted_guitar_gets_fitted_targets() {
        let body = br#"{"pitches": [325, 249, 193.5, 148, 108.7, 83]}"#;
        let targets = tune_guitar(&BridgeModel::fitted(), body).into_targets().unwrap();
        let expected = [329.66, 247.01, 196.01, 146.91, 109.94, 82.41];
        for (t, e) in targets.iter().zip(expected.iter()) {
            assert!((t - e).abs() < 0.01, "{} vs {}", t, e);
        }
    }

    #[test]
    fn test_impossible_pitches_rejected() {
        let model = BridgeModel::fitted();
        let resp = tune_guitar(&model, br#"{"pitches": [-50, -50, -50, -50, -50, -50]}"#);
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Invalid Tunings for a Guitar"));
    }

    #[test]
    fn test_http_roundtrip_and_404() {
        let server = CalibrationServer::bind("127.0.0.1:0", BridgeModel::fitted()).unwrap();
        let addr = server.spawn().unwrap();

        let body = br#"{"pitches": [330, 247, 196]}"#;
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(post_header(body.len()).as_bytes()).unwrap();
        stream.write_all(body).unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"), "{}", reply);
        assert!(reply.ends_with(r#"{"success":false,"error":"Expected 6 string pitches"}"#));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 404"), "{}", reply);
    }

    #[test]
    fn test_oversized_header_dropped_without_waiting() {
        let server = CalibrationServer::bind("127.0.0.1:0", BridgeModel::fitted()).unwrap();
        let addr = server.spawn().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let padding = "a".repeat(MAX_HEADER as usize + 1024);
        let started = Instant::now();
        // The server may hang up before the whole line is written.
        let _ = write!(stream, "POST /tune_guitar HTTP/1.1\r\nX-Padding: {}", padding);
        let mut reply = String::new();
        let _ = stream.read_to_string(&mut reply);
        assert!(reply.is_empty(), "{}", reply);
        assert!(started.elapsed() < READ_TIMEOUT, "connection held for {:?}", started.elapsed());
    }

    #[test]
    fn test_silent_client_times_out() {
        let server = CalibrationServer::bind("127.0.0.1:0", BridgeModel::fitted())
            .unwrap()
            .with_read_timeout(Duration::from_millis(100));
        let addr = server.spawn().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(b"POST /tune_guitar HTTP/1.1\r\n").unwrap();
        let started = Instant::now();
        let mut reply = String::new();
        let _ = stream.read_to_string(&mut reply);
        assert!(reply.is_empty(), "{}", reply);
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[test]
    fn test_body_split_across_header_buffer() {
        let server = CalibrationServer::bind("127.0.0.1:0", BridgeModel::fitted()).unwrap();
        let addr = server.spawn().unwrap();

        let body = serde_json::to_vec(&TuneRequest {
            pitches: STANDARD_TUNING.to_vec(),
        })
        .unwrap();
        let mut request = post_header(body.len()).into_bytes();
        request.extend_from_slice(&body);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&request).unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"), "{}", reply);
        assert!(reply.contains(r#""success":true"#), "{}", reply);
    }
}
