use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use lxstreamer::{Error, RecordOptions, SourceArgs, Streamer};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", port)) {
            return s;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("server did not come up on port {}", port);
}

fn request(port: u16, head: &str) -> String {
    let mut stream = connect(port);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(head.as_bytes()).unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    response
}

fn args(name: &str, url: &str) -> SourceArgs {
    SourceArgs {
        name: name.to_string(),
        url: url.to_string(),
        ..Default::default()
    }
}

#[test]
fn source_registry_round_trip() {
    let streamer = Streamer::new(free_port(), false);

    assert!(streamer.sources().is_empty());
    streamer
        .add_source(args("cam1", "rtsp://127.0.0.1:1/does-not-exist"))
        .unwrap();
    assert_eq!(streamer.sources(), vec!["cam1".to_string()]);

    // duplicates are rejected
    assert!(matches!(
        streamer.add_source(args("cam1", "rtsp://other/url")),
        Err(Error::AlreadyExists)
    ));

    streamer.remove_source("cam1").unwrap();
    assert!(streamer.sources().is_empty());
    assert!(matches!(
        streamer.remove_source("cam1"),
        Err(Error::NotFound)
    ));
}

#[test]
fn invalid_arguments_are_rejected() {
    let streamer = Streamer::new(free_port(), false);
    assert!(matches!(
        streamer.add_source(args("", "rtsp://host/url")),
        Err(Error::InvalidArgument)
    ));
    assert!(matches!(
        streamer.add_source(args("cam", "")),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn recording_toggles_are_idempotent() {
    let streamer = Streamer::new(free_port(), false);
    streamer
        .add_source(args("rec1", "rtsp://127.0.0.1:1/does-not-exist"))
        .unwrap();

    streamer
        .start_recording("rec1", RecordOptions::default())
        .unwrap();
    assert!(matches!(
        streamer.start_recording("rec1", RecordOptions::default()),
        Err(Error::AlreadyDone)
    ));

    streamer.stop_recording("rec1").unwrap();
    assert!(matches!(
        streamer.stop_recording("rec1"),
        Err(Error::AlreadyDone)
    ));

    assert!(matches!(
        streamer.start_recording("missing", RecordOptions::default()),
        Err(Error::NotFound)
    ));
}

#[test]
fn playback_commands_need_a_source() {
    let streamer = Streamer::new(free_port(), false);
    assert!(matches!(streamer.seek("missing", 30), Err(Error::NotFound)));
    assert!(matches!(
        streamer.set_speed("missing", 2.0),
        Err(Error::NotFound)
    ));

    streamer
        .add_source(args("file1", "rtsp://127.0.0.1:1/does-not-exist"))
        .unwrap();
    streamer.seek("file1", 30).unwrap();
    streamer.set_speed("file1", 2.0).unwrap();
}

#[test]
fn stream_endpoint_status_codes() {
    let port = free_port();
    let streamer = Streamer::new(port, false);
    let mut source = args("cam1", "rtsp://127.0.0.1:1/does-not-exist");
    source.auth_session = "token".to_string();
    streamer.add_source(source).unwrap();
    streamer.start();

    // unknown source
    let response = request(
        port,
        "GET /stream?source=missing&session= HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    // bad session token
    let response = request(
        port,
        "GET /stream?source=cam1&session=wrong HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 401"), "got: {}", response);

    // unknown paths and non-GET methods are closed without a reply
    let response = request(port, "GET /other HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.is_empty(), "got: {}", response);
    let response = request(
        port,
        "POST /stream?source=cam1&session=token HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert!(response.is_empty(), "got: {}", response);
}
