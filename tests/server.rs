// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end scenarios driving a real server over real sockets.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rhttpd::config::Config;
use rhttpd::Server;

fn spawn_server(root: &Path, port: u16) {
    let cfg = Config {
        port,
        root: root.to_path_buf(),
        workers: 2,
        queue_capacity: 64,
        idle_timeout_ms: 200,
        max_empty_reads: 200,
    };
    let root = rhttpd::canonical_root(&cfg.root).unwrap();
    let server = Server::new(&cfg, root).expect("server binds and wires up");
    std::thread::spawn(move || server.run());
    // Give the dispatcher loop a moment to reach its first `poll`. The
    // listener is already bound by the time `Server::new` returns, so a
    // connect this soon after just queues in the kernel backlog at worst.
    std::thread::sleep(Duration::from_millis(50));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to test server");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

fn read_all_available(stream: &mut TcpStream, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
}

// Each test binds its own port to avoid interference between parallel runs.
fn test_port(offset: u16) -> u16 {
    20000 + offset
}

#[test]
fn s1_get_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), b"hi\n").unwrap();
    let port = test_port(1);
    spawn_server(dir.path(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut resp = Vec::new();
    read_all_available(&mut stream, &mut resp);
    let text = String::from_utf8_lossy(&resp);

    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-type: text/plain"));
    assert!(text.contains("Content-length: 3"));
    assert!(text.ends_with("hi\n"));
}

#[test]
fn s2_get_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let port = test_port(2);
    spawn_server(dir.path(), port);

    let mut stream = connect(port);
    stream.write_all(b"GET /nope HTTP/1.1\r\n\r\n").unwrap();
    let mut resp = Vec::new();
    read_all_available(&mut stream, &mut resp);
    let text = String::from_utf8_lossy(&resp);

    assert!(text.starts_with("HTTP/1.1 404"));
    assert!(text.contains("404 Not Found!"));
}

#[test]
fn s3_get_default_index() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), b"<p>ok</p>").unwrap();
    let port = test_port(3);
    spawn_server(dir.path(), port);

    let mut stream = connect(port);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut resp = Vec::new();
    read_all_available(&mut stream, &mut resp);
    let text = String::from_utf8_lossy(&resp);

    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-type: text/html"));
    assert!(text.ends_with("<p>ok</p>"));
}

#[test]
fn s4_post_echo_writes_receive_bmp() {
    let dir = tempfile::tempdir().unwrap();
    let port = test_port(4);
    spawn_server(dir.path(), port);

    // A tiny valid PNG, encoded the same way a real client would produce one.
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
    let mut body = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut body), image::ImageFormat::Png)
        .unwrap();

    let mut stream = connect(port);
    let request = format!(
        "POST /upload HTTP/1.1\r\nContent-length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(&body).unwrap();

    let mut resp = Vec::new();
    read_all_available(&mut stream, &mut resp);
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("I have receiced this."));

    // The decode-and-save happens on the worker thread after the response is
    // written; give it a short grace period before checking for the file.
    let receive_path = wait_for_file(&PathBuf::from(dir.path()).join("receive.bmp"));
    assert!(receive_path.exists());
}

fn wait_for_file(path: &Path) -> PathBuf {
    for _ in 0..20 {
        if path.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    path.to_path_buf()
}

#[test]
fn s5_keep_alive_pipelining() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"A").unwrap();
    fs::write(dir.path().join("b.txt"), b"B").unwrap();
    let port = test_port(5);
    spawn_server(dir.path(), port);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();

    let mut resp = vec![0u8; 4096];
    let n = stream.read(&mut resp).unwrap();
    let first = String::from_utf8_lossy(&resp[..n]).to_string();
    assert!(first.contains("Connection: keep-alive"));
    assert!(first.contains("Keep-Alive: timeout=200"));
    assert!(first.ends_with('A'));

    stream
        .write_all(b"GET /b.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let n = stream.read(&mut resp).unwrap();
    let second = String::from_utf8_lossy(&resp[..n]).to_string();
    assert!(second.contains("Connection: keep-alive"));
    assert!(second.ends_with('B'));
}

#[test]
fn s6_idle_connection_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let port = test_port(6);
    spawn_server(dir.path(), port);

    let mut stream = connect(port);
    stream
        .set_read_timeout(Some(Duration::from_millis(600)))
        .unwrap();

    let mut buf = [0u8; 16];
    let result = stream.read(&mut buf);
    // Either a zero-length read (clean close) or a connection-reset error is
    // an acceptable sign the peer tore the socket down; a timeout is not.
    match result {
        Ok(0) => {}
        Ok(n) => panic!("unexpected data on an idle connection: {n} bytes"),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
    }
}
