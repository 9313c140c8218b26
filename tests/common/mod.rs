//! Minimal HTTP stub server for exercising the fetch pipeline.
//!
//! Serves a fixed route table from a background thread so tests can point
//! real clients at `127.0.0.1` without any external network. Bodies are
//! static; tests that need absolute URLs inside scripts interpolate the
//! server's base URL into the script source.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

pub struct StubServer {
    base: String,
}

impl StubServer {
    /// Bind an ephemeral port and serve the route table until the process
    /// exits.
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("stub server addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || handle(stream));
            }
        });
        Self {
            base: format!("http://{addr}"),
        }
    }

    /// Absolute URL for a path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Base URL without a trailing slash, for interpolating into scripts.
    pub fn base(&self) -> &str {
        &self.base
    }
}

fn handle(mut stream: TcpStream) {
    let Ok(peer) = stream.try_clone() else { return };
    let mut reader = BufReader::new(peer);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    // Drain headers; the routes ignore them.
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) if line == "\r\n" || line == "\n" => break,
            Ok(_) => {}
            Err(_) => return,
        }
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, extra_headers, body) = route(path);

    let mut response = format!("HTTP/1.1 {status}\r\n");
    for header in extra_headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str(&format!("content-length: {}\r\n", body.len()));
    response.push_str("connection: close\r\n\r\n");
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(&body);
}

fn route(path: &str) -> (&'static str, Vec<&'static str>, Vec<u8>) {
    match path {
        "/manifest.json" => (
            "200 OK",
            vec!["content-type: application/json"],
            br#"{"version":"1.4.2","path":"/files/app-1.4.2.zip"}"#.to_vec(),
        ),
        "/page.html" => (
            "200 OK",
            vec!["content-type: text/html; charset=utf-8"],
            br#"<html><body>
                <h1>Downloads</h1>
                <a class="download" href="/files/app-1.4.2.zip">Latest build</a>
                <a href="/about">About</a>
            </body></html>"#
                .to_vec(),
        ),
        "/files/app-1.4.2.zip" => (
            "200 OK",
            vec![
                "content-type: application/zip",
                "content-disposition: attachment; filename=\"app-1.4.2.zip\"",
            ],
            b"PK\x03\x04fake zip payload".to_vec(),
        ),
        "/plain" => (
            "200 OK",
            vec!["content-type: text/plain; charset=utf-8"],
            b"hello plain text".to_vec(),
        ),
        "/redirect" => (
            "302 Found",
            vec!["location: /plain"],
            Vec::new(),
        ),
        "/error" => (
            "500 Internal Server Error",
            vec!["content-type: text/plain"],
            b"upstream exploded".to_vec(),
        ),
        _ => (
            "404 Not Found",
            vec!["content-type: text/plain"],
            b"not here".to_vec(),
        ),
    }
}
