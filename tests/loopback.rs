//! Drives a real server on 127.0.0.1 with blocking std sockets.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quizcast::crypto::Cipher;
use quizcast::net::framing::{decode, encode, Decoded, Opcode};
use quizcast::{Config, Server, ServerHandle};
use simd_json::prelude::*;
use simd_json::OwnedValue;

const SECRET: &str = "classroom";
const CLIENT_MASK: [u8; 4] = [0x5a, 0x01, 0xc3, 0x7e];

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: JoinHandle<Result<(), String>>,
}

impl Running {
    fn start() -> Self {
        let config = Config::new("127.0.0.1:0".parse().unwrap(), SECRET);
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run().map_err(|e| e.to_string()));
        Self { addr, handle, thread }
    }

    fn stop(self) {
        self.handle.stop().unwrap();
        self.thread.join().unwrap().unwrap();
    }
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
    cipher: Cipher,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(
            stream,
            "GET /quiz HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        )
        .unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed during handshake");
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        assert!(head.starts_with("HTTP/1.1 101 "), "unexpected response: {head}");
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        buf.drain(..head_end);

        Self {
            stream,
            buf,
            cipher: Cipher::new(SECRET).unwrap(),
        }
    }

    fn send_raw(&mut self, text: &str) {
        let frame = encode(text.as_bytes(), Opcode::Text, false, Some(CLIENT_MASK));
        self.stream.write_all(&frame).unwrap();
    }

    fn send(&mut self, json: &str) {
        let wire = self.cipher.encrypt(json);
        self.send_raw(&wire);
    }

    /// Sends an envelope and a close frame in a single write.
    fn send_then_close(&mut self, json: &str) {
        let wire = self.cipher.encrypt(json);
        let mut burst = encode(wire.as_bytes(), Opcode::Text, false, Some(CLIENT_MASK));
        burst.extend(encode(&[0x03, 0xE8], Opcode::Close, false, Some(CLIENT_MASK)));
        self.stream.write_all(&burst).unwrap();
    }

    fn recv(&mut self) -> OwnedValue {
        let mut chunk = [0u8; 4096];
        loop {
            if let Decoded::Frame { frame, consumed } = decode(&self.buf, 1 << 20) {
                self.buf.drain(..consumed);
                let wire = String::from_utf8(frame.payload).unwrap();
                let json = self.cipher.decrypt(&wire).expect("server frame did not decrypt");
                let mut bytes = json.into_bytes();
                return simd_json::to_owned_value(&mut bytes).unwrap();
            }
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed while waiting for a message");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn expect_closed(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return,
                Err(e) => panic!("connection still open: {e}"),
            }
        }
    }
}

fn action(value: &OwnedValue) -> &str {
    value.get("action").and_then(|v| v.as_str()).unwrap_or_default()
}

fn count(value: &OwnedValue) -> u64 {
    value.get("count").and_then(|v| v.as_u64()).unwrap_or(u64::MAX)
}

fn join(addr: SocketAddr, usertype: &str, userid: u32) -> Client {
    let mut client = Client::connect(addr);
    client.send(&format!(
        r#"{{"action":"newuser","sid":5,"usertype":"{usertype}","userid":{userid},"name":"user {userid}","pic":""}}"#
    ));
    client
}

#[test]
fn classroom_round_trip() {
    let server = Running::start();

    let mut teacher = join(server.addr, "teacher", 1);
    let roster = teacher.recv();
    assert_eq!(action(&roster), "newuser");
    assert_eq!(count(&roster), 0);

    let mut s1 = join(server.addr, "student", 11);
    assert_eq!(count(&s1.recv()), 1);
    assert_eq!(count(&teacher.recv()), 1);

    let mut s2 = join(server.addr, "student", 12);
    assert_eq!(count(&s2.recv()), 2);
    assert_eq!(count(&s1.recv()), 2);
    let roster = teacher.recv();
    assert_eq!(count(&roster), 2);
    let students = roster.get("students").and_then(|v| v.as_array()).unwrap();
    assert_eq!(students[1].get("name").and_then(|v| v.as_str()), Some("user 12"));

    teacher.send(r#"{"action":"question","sid":5,"context":{"qid":42,"text":"2+2?"}}"#);
    for student in [&mut s1, &mut s2] {
        let question = student.recv();
        assert_eq!(action(&question), "question");
        let context = question.get("context").unwrap();
        assert_eq!(context.get("qid").and_then(|v| v.as_u64()), Some(42));
        assert_eq!(context.get("text").and_then(|v| v.as_str()), Some("2+2?"));
    }

    // the broadcast is not echoed: the next thing the teacher sees is the pong
    teacher.send_raw("ping");
    let reply = teacher.recv();
    assert_eq!(action(&reply), "connect");
    // sid comes back as the number the page sent
    assert_eq!(reply.get("sid").and_then(|v| v.as_u64()), Some(5));

    s1.send(r#"{"action":"alreadyAnswered","sid":5,"oft":true,"userid":11,"jqid":3}"#);
    let answered = teacher.recv();
    assert_eq!(action(&answered), "alreadyAnswered");
    assert_eq!(answered.get("jqid").and_then(|v| v.as_u64()), Some(3));

    drop(teacher);
    s1.expect_closed();
    s2.expect_closed();

    server.stop();
}

#[test]
fn second_teacher_is_turned_away() {
    let server = Running::start();

    let mut teacher = join(server.addr, "teacher", 1);
    teacher.recv();

    let mut impostor = join(server.addr, "teacher", 2);
    assert_eq!(action(&impostor.recv()), "alreadyteacher");
    impostor.expect_closed();

    teacher.send_raw("diag");
    let diag = teacher.recv();
    assert_eq!(action(&diag), "diag");
    assert_eq!(diag.get("teacher").and_then(|v| v.as_bool()), Some(true));

    server.stop();
}

#[test]
fn garbage_is_answered_then_closed() {
    let server = Running::start();

    let mut client = Client::connect(server.addr);
    client.send("{ this is not json");
    let reply = client.recv();
    assert_eq!(action(&reply), "error");
    client.expect_closed();

    server.stop();
}

#[test]
fn close_code_ends_the_connection() {
    let server = Running::start();

    let mut client = Client::connect(server.addr);
    let close = encode(&[0x03, 0xE8], Opcode::Text, false, Some(CLIENT_MASK));
    client.stream.write_all(&close).unwrap();
    client.expect_closed();

    server.stop();
}

#[test]
fn last_answer_arrives_before_the_close() {
    let server = Running::start();

    let mut teacher = join(server.addr, "teacher", 1);
    teacher.recv();
    let mut student = join(server.addr, "student", 11);
    student.recv();
    teacher.recv();

    student.send_then_close(r#"{"action":"alreadyAnswered","sid":5,"oft":true,"userid":11,"jqid":9}"#);
    let answered = teacher.recv();
    assert_eq!(action(&answered), "alreadyAnswered");
    assert_eq!(answered.get("jqid").and_then(|v| v.as_u64()), Some(9));
    assert_eq!(action(&teacher.recv()), "userdisconnected");
    student.expect_closed();

    server.stop();
}
