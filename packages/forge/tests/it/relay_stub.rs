//! A minimal in-process relay server for integration tests.
//!
//! Speaks just enough HTTP/1.1 for the blocking client: health, CAS
//! check/read/write, and the target/action entry endpoints. State lives in
//! maps behind a mutex so tests can assert on what was pushed.

use std::{
    collections::{BTreeMap, HashMap},
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
};

use url::Url;

#[derive(Default)]
pub struct StubState {
    pub blobs: HashMap<String, Vec<u8>>,
    pub targets: HashMap<String, serde_json::Value>,
    pub actions: HashMap<String, serde_json::Value>,
}

/// Handle to a running stub server.
pub struct RelayStub {
    pub url: Url,
    pub state: Arc<Mutex<StubState>>,
}

impl RelayStub {
    /// Start a stub on an ephemeral port. The accept loop runs on a
    /// detached thread for the life of the test process.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
        let addr = listener.local_addr().expect("stub addr");
        let state = Arc::new(Mutex::new(StubState::default()));

        let serve_state = Arc::clone(&state);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let state = Arc::clone(&serve_state);
                std::thread::spawn(move || {
                    let _ = serve(stream, state);
                });
            }
        });

        Self {
            url: Url::parse(&format!("http://{addr}/")).expect("stub url"),
            state,
        }
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().unwrap().targets.len()
    }
}

fn serve(stream: TcpStream, state: Arc<Mutex<StubState>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    let (status, response) = route(&method, &path, &body, &state);
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
        response.len()
    )?;
    stream.write_all(&response)?;
    stream.flush()
}

fn route(
    method: &str,
    path: &str,
    body: &[u8],
    state: &Arc<Mutex<StubState>>,
) -> (&'static str, Vec<u8>) {
    let mut state = state.lock().unwrap();

    if path == "/api/v1/health" {
        return ("200 OK", Vec::new());
    }

    if path == "/api/v1/cas/check" && method == "POST" {
        let request: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
        let present = request["keys"]
            .as_array()
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| key.as_str())
                    .filter(|key| state.blobs.contains_key(*key))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let response = serde_json::json!({ "present": present });
        return ("200 OK", serde_json::to_vec(&response).unwrap());
    }

    if let Some(hex) = path.strip_prefix("/api/v1/cas/") {
        return match method {
            "HEAD" => match state.blobs.contains_key(hex) {
                true => ("200 OK", Vec::new()),
                false => ("404 Not Found", Vec::new()),
            },
            "GET" => match state.blobs.get(hex) {
                Some(content) => ("200 OK", content.clone()),
                None => ("404 Not Found", Vec::new()),
            },
            "PUT" => {
                state.blobs.insert(hex.to_string(), body.to_vec());
                ("201 Created", Vec::new())
            }
            _ => ("405 Method Not Allowed", Vec::new()),
        };
    }

    for kind in ["targets", "actions"] {
        let base = format!("/api/v1/cache/{kind}");
        fn entries<'a>(
            state: &'a mut StubState,
            kind: &str,
        ) -> &'a mut HashMap<String, serde_json::Value> {
            match kind {
                "targets" => &mut state.targets,
                _ => &mut state.actions,
            }
        }

        if path == base && method == "POST" {
            let request: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
            if let Some(map) = request["entries"].as_object() {
                for (fingerprint, entry) in map {
                    entries(&mut state, kind).insert(fingerprint.clone(), entry.clone());
                }
            }
            return ("201 Created", Vec::new());
        }

        if let Some(fingerprint) = path.strip_prefix(&format!("{base}/")) {
            if method == "GET" {
                return match entries(&mut state, kind).get(fingerprint) {
                    Some(entry) => {
                        let mut map = BTreeMap::new();
                        map.insert(fingerprint.to_string(), entry.clone());
                        let response = serde_json::json!({ "entries": map });
                        ("200 OK", serde_json::to_vec(&response).unwrap())
                    }
                    None => ("404 Not Found", Vec::new()),
                };
            }
        }
    }

    ("404 Not Found", Vec::new())
}
