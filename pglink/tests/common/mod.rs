//! An in-process postgres backend good enough to drive the client end to
//! end: startup, the four authentication flows, the extended-query cycle and
//! a tiny `weather` table with transaction semantics.
//!
//! The table is shared between connections (committed state behind a lock,
//! per-connection overlay inside a transaction block), so concurrent-session
//! scenarios behave like the real thing.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

use pglink::{Config, Credential};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy)]
pub enum AuthMode {
    Trust,
    Cleartext(&'static str),
    Md5(&'static str),
    Scram(&'static str),
}

#[derive(Clone)]
pub struct ServerOptions {
    pub auth: AuthMode,
    /// ParameterStatus overrides sent after authentication, on top of the
    /// conforming defaults.
    pub parameter_overrides: Vec<(&'static str, &'static str)>,
    /// Emit a NoticeResponse ahead of the rows of every SELECT.
    pub notice_before_rows: bool,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            auth: AuthMode::Trust,
            parameter_overrides: Vec::new(),
            notice_before_rows: false,
        }
    }
}

/// One row of the `weather` table, all columns in text form.
#[derive(Clone, PartialEq)]
pub struct Weather {
    pub city: String,
    pub temp_lo: String,
    pub temp_hi: String,
    pub prcp: Option<String>,
    pub date: String,
}

fn weather(city: &str, lo: &str, hi: &str, prcp: Option<&str>, date: &str) -> Weather {
    Weather {
        city: city.into(),
        temp_lo: lo.into(),
        temp_hi: hi.into(),
        prcp: prcp.map(Into::into),
        date: date.into(),
    }
}

pub fn seed() -> Vec<Weather> {
    vec![
        weather("San Francisco", "46", "50", Some("0.25"), "1994-11-27"),
        weather("San Francisco", "43", "57", Some("0"), "1994-11-29"),
        weather("Hayward", "37", "54", None, "1994-11-29"),
    ]
}

pub struct MockServer {
    addr: SocketAddr,
    options: ServerOptions,
    events: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    table: Arc<Mutex<Vec<Weather>>>,
}

impl MockServer {
    pub fn start(options: ServerOptions) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let events = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let table = Arc::new(Mutex::new(seed()));

        {
            let options = options.clone();
            let events = events.clone();
            let accepted = accepted.clone();
            let table = table.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { return };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let options = options.clone();
                    let events = events.clone();
                    let table = table.clone();
                    thread::spawn(move || {
                        let _ = Session { stream, options, events, table }.run();
                    });
                }
            });
        }

        MockServer { addr, options, events, accepted, table }
    }

    /// A client config pointing at this server with the matching credential.
    pub fn config(&self) -> Config {
        let credential = match self.options.auth {
            AuthMode::Trust => Credential::Trust,
            AuthMode::Cleartext(p) => Credential::CleartextPassword { password: p.into() },
            AuthMode::Md5(p) => Credential::Md5Password { password: p.into() },
            AuthMode::Scram(p) => Credential::ScramSha256 { password: p.into() },
        };
        Config {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            ssl: false,
            socket_timeout: Duration::from_secs(5),
            database: "weatherdb".into(),
            user: "bob".into(),
            credential,
            ..Config::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn committed_rows(&self) -> Vec<Weather> {
        self.table.lock().unwrap().clone()
    }
}

struct Session {
    stream: TcpStream,
    options: ServerOptions,
    events: Arc<Mutex<Vec<String>>>,
    table: Arc<Mutex<Vec<Weather>>>,
}

const WEATHER_BY_CITY: &str =
    "SELECT city, temp_lo, temp_hi, prcp, date FROM weather WHERE city = $1";
const ALL_CITIES: &str = "SELECT city FROM weather";
const DELETE_ALL: &str = "DELETE FROM weather";
const SELECT_ONE: &str = "SELECT 1";

impl Session {
    fn event(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn run(mut self) -> std::io::Result<()> {
        let startup = self.read_startup()?;
        let user = startup.get("user").cloned().unwrap_or_default();

        if !self.authenticate(&user)? {
            return Ok(());
        }
        self.event("auth-ok");

        let mut out = BytesMut::new();
        let mut parameters: Vec<(&str, &str)> = vec![
            ("server_version", "16.2"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("TimeZone", "UTC"),
        ];
        for (name, value) in self.options.parameter_overrides.iter().copied() {
            match parameters.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => parameters.push((name, value)),
            }
        }
        for (name, value) in parameters {
            msg(&mut out, b'S', |b| {
                nul(b, name);
                nul(b, value);
            });
        }
        msg(&mut out, b'K', |b| {
            b.put_i32(4242);
            b.put_i32(0x5ec2e7);
        });
        msg(&mut out, b'Z', |b| b.put_u8(b'I'));
        self.stream.write_all(&out)?;

        self.serve()
    }

    fn read_message(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header)?;
        let len = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body)?;
        Ok((header[0], body))
    }

    fn read_startup(&mut self) -> std::io::Result<HashMap<String, String>> {
        loop {
            let mut len = [0u8; 4];
            self.stream.read_exact(&mut len)?;
            let len = i32::from_be_bytes(len) as usize;
            let mut body = vec![0u8; len - 4];
            self.stream.read_exact(&mut body)?;

            let code = i32::from_be_bytes(body[..4].try_into().unwrap());
            if code == 80877103 {
                // SSLRequest: refuse, the suite runs in the clear
                self.stream.write_all(b"N")?;
                continue;
            }
            assert_eq!(code, 196608, "unexpected protocol version");

            let mut params = HashMap::new();
            let mut rest = &body[4..];
            loop {
                let Some(end) = rest.iter().position(|b| *b == 0) else { break };
                if end == 0 {
                    break;
                }
                let name = String::from_utf8_lossy(&rest[..end]).into_owned();
                rest = &rest[end + 1..];
                let end = rest.iter().position(|b| *b == 0).unwrap();
                let value = String::from_utf8_lossy(&rest[..end]).into_owned();
                rest = &rest[end + 1..];
                params.insert(name, value);
            }
            self.event(format!("startup:{}", params.get("user").cloned().unwrap_or_default()));
            return Ok(params);
        }
    }

    fn authenticate(&mut self, user: &str) -> std::io::Result<bool> {
        match self.options.auth {
            AuthMode::Trust => {
                self.write_auth(0, &[])?;
                Ok(true)
            }
            AuthMode::Cleartext(password) => {
                self.write_auth(3, &[])?;
                let (tag, body) = self.read_message()?;
                assert_eq!(tag, b'p');
                self.event("password-message");
                let supplied = read_nul(&body);
                if supplied == password {
                    self.write_auth(0, &[])?;
                    Ok(true)
                } else {
                    self.auth_failed(user)
                }
            }
            AuthMode::Md5(password) => {
                let salt = [0x01, 0x02, 0x03, 0x04];
                self.write_auth(5, &salt)?;
                let (tag, body) = self.read_message()?;
                assert_eq!(tag, b'p');
                self.event("password-message");
                let supplied = read_nul(&body);
                let inner = hex::encode(Md5::new().chain_update(password).chain_update(user).finalize());
                let expected = format!(
                    "md5{}",
                    hex::encode(Md5::new().chain_update(inner.as_bytes()).chain_update(salt).finalize())
                );
                if supplied == expected {
                    self.write_auth(0, &[])?;
                    Ok(true)
                } else {
                    self.auth_failed(user)
                }
            }
            AuthMode::Scram(password) => self.scram(password),
        }
    }

    fn scram(&mut self, password: &str) -> std::io::Result<bool> {
        let mut mechanisms = BytesMut::new();
        nul(&mut mechanisms, "SCRAM-SHA-256");
        mechanisms.put_u8(0);
        self.write_auth(10, &mechanisms)?;

        let (tag, body) = self.read_message()?;
        assert_eq!(tag, b'p');
        self.event("sasl-initial-response");
        // mechanism, then length-prefixed client-first
        let mechanism = read_nul(&body);
        assert_eq!(mechanism, "SCRAM-SHA-256");
        let rest = &body[mechanism.len() + 1 + 4..];
        let client_first = String::from_utf8(rest.to_vec()).unwrap();
        let client_first_bare = client_first.strip_prefix("n,,").expect("gs2 header");
        let client_nonce = client_first_bare
            .split(',')
            .find_map(|a| a.strip_prefix("r="))
            .expect("client nonce");

        let salt = b"mock-salt-0123456789abcd";
        let iterations = 4096u32;
        let server_nonce = format!("{client_nonce}3rfcNHYJY1ZVvWVs7j");
        let server_first =
            format!("r={server_nonce},s={},i={iterations}", BASE64.encode(salt));
        self.write_auth(11, server_first.as_bytes())?;

        let (tag, body) = self.read_message()?;
        assert_eq!(tag, b'p');
        let client_final = String::from_utf8(body).unwrap();
        let without_proof = client_final
            .rsplit_once(",p=")
            .expect("client proof")
            .0
            .to_owned();
        let proof = client_final.rsplit_once(",p=").unwrap().1;

        let salted = hi(password.as_bytes(), salt, iterations);
        let client_key = mac(&salted, b"Client Key");
        let stored_key = <Sha256 as Digest>::digest(client_key);
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let signature = mac(&stored_key, auth_message.as_bytes());
        let expected: Vec<u8> = client_key
            .iter()
            .zip(signature)
            .map(|(k, s)| k ^ s)
            .collect();

        if BASE64.encode(&expected) != proof {
            return self.auth_failed("scram");
        }

        let server_key = mac(&salted, b"Server Key");
        let server_signature = mac(&server_key, auth_message.as_bytes());
        let final_message = format!("v={}", BASE64.encode(server_signature));
        self.write_auth(12, final_message.as_bytes())?;
        self.write_auth(0, &[])?;
        Ok(true)
    }

    fn auth_failed(&mut self, user: &str) -> std::io::Result<bool> {
        let mut out = BytesMut::new();
        error_response(
            &mut out,
            "FATAL",
            "28P01",
            &format!("password authentication failed for user \"{user}\""),
        );
        self.stream.write_all(&out)?;
        Ok(false)
    }

    fn write_auth(&mut self, code: i32, payload: &[u8]) -> std::io::Result<()> {
        let mut out = BytesMut::new();
        msg(&mut out, b'R', |b| {
            b.put_i32(code);
            b.put_slice(payload);
        });
        self.stream.write_all(&out)
    }

    fn serve(&mut self) -> std::io::Result<()> {
        let mut prepared: HashMap<String, String> = HashMap::new();
        let mut portal: Option<(String, Vec<Option<String>>)> = None;
        let mut overlay: Option<Vec<Weather>> = None;
        let mut status = b'I';
        let mut skip_until_sync = false;

        loop {
            let (tag, body) = self.read_message()?;
            let mut out = BytesMut::new();

            if skip_until_sync && tag != b'S' && tag != b'X' {
                continue;
            }

            match tag {
                b'P' => {
                    let name = read_nul(&body);
                    let sql = read_nul(&body[name.len() + 1..]);
                    self.event(format!("parse:{sql}"));
                    if known_sql(&sql) {
                        prepared.insert(name, sql);
                        msg(&mut out, b'1', |_| {});
                    } else {
                        error_response(&mut out, "ERROR", "42601", "syntax error at or near the beginning");
                        skip_until_sync = true;
                        if status == b'T' {
                            status = b'E';
                        }
                    }
                }
                b'D' => {
                    let kind = body[0];
                    assert_eq!(kind, b'S');
                    let name = read_nul(&body[1..]);
                    let sql = prepared.get(&name).cloned().unwrap_or_default();
                    describe(&mut out, &sql);
                }
                b'B' => {
                    let mut r = Reader::new(&body);
                    let _portal = r.nul();
                    let stmt = r.nul();
                    let nfmt = r.i16();
                    for _ in 0..nfmt {
                        r.i16();
                    }
                    let nparams = r.i16();
                    let mut params = Vec::new();
                    for _ in 0..nparams {
                        let len = r.i32();
                        if len < 0 {
                            params.push(None);
                        } else {
                            params.push(Some(r.text(len as usize)));
                        }
                    }
                    let sql = prepared.get(&stmt).cloned().unwrap_or_default();
                    portal = Some((sql, params));
                    msg(&mut out, b'2', |_| {});
                }
                b'E' => {
                    let Some((sql, params)) = portal.clone() else {
                        error_response(&mut out, "ERROR", "34000", "portal does not exist");
                        skip_until_sync = true;
                        self.stream.write_all(&out)?;
                        continue;
                    };
                    self.execute(&mut out, &sql, &params, &mut overlay, &mut status);
                }
                b'C' => {
                    msg(&mut out, b'3', |_| {});
                }
                b'S' => {
                    skip_until_sync = false;
                    msg(&mut out, b'Z', |b| b.put_u8(status));
                }
                b'X' => {
                    self.event("terminate");
                    return Ok(());
                }
                other => panic!("mock server: unexpected frontend message {:?}", char::from(other)),
            }

            self.stream.write_all(&out)?;
        }
    }

    fn execute(
        &self,
        out: &mut BytesMut,
        sql: &str,
        params: &[Option<String>],
        overlay: &mut Option<Vec<Weather>>,
        status: &mut u8,
    ) {
        match sql {
            "BEGIN" => {
                *overlay = Some(self.table.lock().unwrap().clone());
                *status = b'T';
                command_complete(out, "BEGIN");
            }
            "COMMIT" => {
                if *status == b'T' {
                    if let Some(rows) = overlay.take() {
                        *self.table.lock().unwrap() = rows;
                    }
                }
                overlay.take();
                *status = b'I';
                command_complete(out, "COMMIT");
            }
            "ROLLBACK" => {
                overlay.take();
                *status = b'I';
                command_complete(out, "ROLLBACK");
            }
            DELETE_ALL => {
                let deleted = match overlay.as_mut() {
                    Some(rows) => {
                        let n = rows.len();
                        rows.clear();
                        n
                    }
                    None => {
                        let mut rows = self.table.lock().unwrap();
                        let n = rows.len();
                        rows.clear();
                        n
                    }
                };
                command_complete(out, &format!("DELETE {deleted}"));
            }
            SELECT_ONE => {
                self.maybe_notice(out);
                data_row(out, &[Some("1")]);
                command_complete(out, "SELECT 1");
            }
            ALL_CITIES => {
                self.maybe_notice(out);
                let rows = match overlay.as_ref() {
                    Some(rows) => rows.clone(),
                    None => self.table.lock().unwrap().clone(),
                };
                for row in &rows {
                    data_row(out, &[Some(&row.city)]);
                }
                command_complete(out, &format!("SELECT {}", rows.len()));
            }
            WEATHER_BY_CITY => {
                self.maybe_notice(out);
                let city = params.first().cloned().flatten();
                let rows = match overlay.as_ref() {
                    Some(rows) => rows.clone(),
                    None => self.table.lock().unwrap().clone(),
                };
                let mut n = 0;
                for row in rows.iter().filter(|r| Some(&r.city) == city.as_ref()) {
                    n += 1;
                    data_row(
                        out,
                        &[
                            Some(&row.city),
                            Some(&row.temp_lo),
                            Some(&row.temp_hi),
                            row.prcp.as_deref(),
                            Some(&row.date),
                        ],
                    );
                }
                command_complete(out, &format!("SELECT {n}"));
            }
            other => panic!("mock server: unknown portal sql {other:?}"),
        }
    }

    fn maybe_notice(&self, out: &mut BytesMut) {
        if self.options.notice_before_rows {
            msg(out, b'N', |b| {
                b.put_u8(b'S');
                nul(b, "NOTICE");
                b.put_u8(b'V');
                nul(b, "NOTICE");
                b.put_u8(b'C');
                nul(b, "00000");
                b.put_u8(b'M');
                nul(b, "mock notice");
                b.put_u8(0);
            });
        }
    }
}

fn known_sql(sql: &str) -> bool {
    matches!(
        sql,
        WEATHER_BY_CITY | ALL_CITIES | DELETE_ALL | SELECT_ONE | "BEGIN" | "COMMIT" | "ROLLBACK"
    )
}

fn describe(out: &mut BytesMut, sql: &str) {
    let nparams = sql.matches('$').count();
    msg(out, b't', |b| {
        b.put_i16(nparams as i16);
        for _ in 0..nparams {
            b.put_u32(25);
        }
    });

    let columns: &[(&str, u32)] = match sql {
        WEATHER_BY_CITY => &[
            ("city", 25),
            ("temp_lo", 23),
            ("temp_hi", 23),
            ("prcp", 700),
            ("date", 1082),
        ],
        ALL_CITIES => &[("city", 25)],
        SELECT_ONE => &[("?column?", 23)],
        _ => {
            msg(out, b'n', |_| {});
            return;
        }
    };
    msg(out, b'T', |b| {
        b.put_i16(columns.len() as i16);
        for (i, (name, oid)) in columns.iter().enumerate() {
            nul(b, name);
            b.put_u32(0);
            b.put_i16(i as i16 + 1);
            b.put_u32(*oid);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
    });
}

// ===== wire helpers =====

fn msg(buf: &mut BytesMut, tag: u8, f: impl FnOnce(&mut BytesMut)) {
    let mut body = BytesMut::new();
    f(&mut body);
    buf.put_u8(tag);
    buf.put_i32(4 + body.len() as i32);
    buf.extend_from_slice(&body);
}

fn nul(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn read_nul(body: &[u8]) -> String {
    let end = body.iter().position(|b| *b == 0).expect("nul terminator");
    String::from_utf8(body[..end].to_vec()).expect("utf8")
}

fn data_row(out: &mut BytesMut, values: &[Option<&str>]) {
    msg(out, b'D', |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                None => b.put_i32(-1),
                Some(text) => {
                    b.put_i32(text.len() as i32);
                    b.put_slice(text.as_bytes());
                }
            }
        }
    });
}

fn command_complete(out: &mut BytesMut, tag_text: &str) {
    msg(out, b'C', |b| nul(b, tag_text));
}

fn error_response(out: &mut BytesMut, severity: &str, code: &str, message: &str) {
    msg(out, b'E', |b| {
        b.put_u8(b'S');
        nul(b, severity);
        b.put_u8(b'V');
        nul(b, severity);
        b.put_u8(b'C');
        nul(b, code);
        b.put_u8(b'M');
        nul(b, message);
        b.put_u8(0);
    });
}

fn mac(key: &[u8], data: &[u8]) -> [u8; 32] {
    HmacSha256::new_from_slice(key)
        .unwrap()
        .chain_update(data)
        .finalize()
        .into_bytes()
        .into()
}

fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut prev = HmacSha256::new_from_slice(password)
        .unwrap()
        .chain_update(salt)
        .chain_update(1u32.to_be_bytes())
        .finalize()
        .into_bytes();
    let mut output = prev;
    for _ in 1..iterations {
        prev = HmacSha256::new_from_slice(password)
            .unwrap()
            .chain_update(prev)
            .finalize()
            .into_bytes();
        for (out, prev) in output.iter_mut().zip(prev) {
            *out ^= prev;
        }
    }
    output.into()
}

struct Reader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(body: &'a [u8]) -> Reader<'a> {
        Reader { body, pos: 0 }
    }

    fn nul(&mut self) -> String {
        let s = read_nul(&self.body[self.pos..]);
        self.pos += s.len() + 1;
        s
    }

    fn i16(&mut self) -> i16 {
        let v = i16::from_be_bytes(self.body[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }

    fn i32(&mut self) -> i32 {
        let v = i32::from_be_bytes(self.body[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn text(&mut self, len: usize) -> String {
        let s = String::from_utf8(self.body[self.pos..self.pos + len].to_vec()).expect("utf8");
        self.pos += len;
        s
    }
}
