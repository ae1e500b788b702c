//! The non-blocking, pipelining Memcached client: command construction,
//! the FIFO response-descriptor queue, and the two-state response
//! parser (expecting-next-reply / reading-value-body).

use crate::attachment::LoopHandle;
use crate::buffers::{AsyncBuffers, Connection};
use crate::config::ClientConfig;
use crate::error::Error;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    None,
    Connecting,
    Connected,
}

type StoreCallback = Box<dyn FnOnce(StoreResult) + Send>;
type IntCallback = Box<dyn FnOnce(Option<u64>) + Send>;
type BoolCallback = Box<dyn FnOnce(bool) + Send>;
type ErrorCallback = Box<dyn FnOnce(Error) + Send>;
type GetCallback = Box<dyn FnMut(Vec<u8>, Vec<u8>, u32, Option<u64>) + Send>;
type GetEndCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

/// A pending Get or Gets/Gat/Gats request: the descriptor stays at the
/// front of the queue across every `VALUE` line until `END` is parsed.
pub struct GetDescriptor {
    keys: Vec<Vec<u8>>,
    seen: Vec<bool>,
    track_notfound: bool,
    on_get: GetCallback,
    on_get_end: Option<GetEndCallback>,
}

/// Per-request record awaiting a response on the connection. Enqueued in
/// wire request order; dequeued (or, for Get, consulted) in the same
/// order as responses arrive, since the text protocol guarantees
/// response order equals request order on a connection.
pub enum ResponseDescriptor {
    Store {
        on_store: StoreCallback,
        on_error: Option<ErrorCallback>,
    },
    Increment {
        on_increment: IntCallback,
        on_error: Option<ErrorCallback>,
    },
    Remove {
        on_remove: BoolCallback,
        on_error: Option<ErrorCallback>,
    },
    Touch {
        on_touch: BoolCallback,
        on_error: Option<ErrorCallback>,
    },
    Get(GetDescriptor),
}

impl ResponseDescriptor {
    fn take_on_error(&mut self) -> Option<ErrorCallback> {
        match self {
            ResponseDescriptor::Store { on_error, .. }
            | ResponseDescriptor::Increment { on_error, .. }
            | ResponseDescriptor::Remove { on_error, .. }
            | ResponseDescriptor::Touch { on_error, .. } => on_error.take(),
            ResponseDescriptor::Get(_) => None,
        }
    }
}

enum ParserState {
    ExpectingReply,
    ReadingValueBody {
        key: Vec<u8>,
        flags: u32,
        size: usize,
        cas: Option<u64>,
    },
}

/// A non-blocking, pipelining Memcached client over a generic
/// [`Connection`]. Commands are built and queued synchronously; actual
/// socket I/O happens in [`MemcachedClient::run_local`] (or the
/// lower-level [`MemcachedClient::flush`] / [`MemcachedClient::poll`]).
pub struct MemcachedClient<C: Connection> {
    id: u64,
    conn: Option<C>,
    state: ClientState,
    config: ClientConfig,
    buffers: AsyncBuffers,
    queue: VecDeque<ResponseDescriptor>,
    parse_state: ParserState,
    on_error: Option<Box<dyn FnMut(&Error) + Send>>,
    on_connect: Option<Box<dyn FnMut() + Send>>,
    loop_handle: Option<LoopHandle>,
}

impl<C: Connection> MemcachedClient<C> {
    pub fn new(config: ClientConfig) -> Self {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let initial = config.initial_buffer_size;
        Self {
            id,
            conn: None,
            state: ClientState::None,
            config,
            buffers: AsyncBuffers::new(initial, initial.max(crate::config::DEFAULT_MAX_INITIAL_READ)),
            queue: VecDeque::new(),
            parse_state: ParserState::ExpectingReply,
            on_error: None,
            on_connect: None,
            loop_handle: None,
        }
    }

    pub fn set_on_error<F: FnMut(&Error) + Send + 'static>(&mut self, f: F) {
        self.on_error = Some(Box::new(f));
    }

    /// Registers a callback fired once a connection attempt succeeds.
    pub fn set_on_connect<F: FnMut() + Send + 'static>(&mut self, f: F) {
        self.on_connect = Some(Box::new(f));
    }

    /// Sets the read/write timeouts, applying them immediately to the
    /// live connection (if any) in addition to future ones.
    pub fn set_timeout(&mut self, read: Option<Duration>, write: Option<Duration>) {
        self.config.read_timeout = read;
        self.config.write_timeout = write;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_read_timeout(read);
            conn.set_write_timeout(write);
        }
    }

    /// Shares another client's or server's event-loop handle so this
    /// client runs on it instead of its own. Per the attachment
    /// invariant, this is only honored before the first `connect_*`
    /// call; afterwards it is silently ignored.
    pub fn attach_to(&mut self, handle: LoopHandle) {
        if self.state == ClientState::None {
            self.loop_handle = Some(handle);
        } else {
            warn!(client_id = self.id, "attach_to called after connect; ignored");
        }
    }

    pub fn loop_handle(&self) -> Option<&LoopHandle> {
        self.loop_handle.as_ref()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Connects to `addr`. Non-blocking in spirit: requests may be
    /// queued before this resolves (they sit in the write buffer), but
    /// since this implementation awaits the connect directly there is no
    /// observable "queued while connecting" window beyond the state
    /// transition itself.
    pub async fn connect_ip(&mut self, addr: impl Into<String>) -> Result<(), Error> {
        self.state = ClientState::Connecting;
        let mut conn = C::connect(addr.into()).await.map_err(|e| match e {
            Error::IoRead(io) => Error::Connect(io),
            other => other,
        })?;
        conn.set_read_timeout(self.config.read_timeout);
        conn.set_write_timeout(self.config.write_timeout);
        self.conn = Some(conn);
        self.state = ClientState::Connected;
        debug!(client_id = self.id, "client connected");
        if let Some(on_connect) = self.on_connect.as_mut() {
            on_connect();
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.conn = None;
        self.state = ClientState::None;
        self.fail_all_queued(Error::Closed);
    }

    fn fail_all_queued(&mut self, _err: Error) {
        // Remaining queued descriptors' callbacks do not fire (S6):
        // they are simply dropped.
        self.queue.clear();
    }

    fn conn_mut(&mut self) -> Result<&mut C, Error> {
        self.conn.as_mut().ok_or(Error::Closed)
    }

    fn enqueue(&mut self, descriptor: ResponseDescriptor) -> Result<(), Error> {
        if self.queue.len() >= self.config.queue_capacity {
            return Err(Error::Backpressure("response queue is full".into()));
        }
        self.queue.push_back(descriptor);
        Ok(())
    }

    // -- command construction -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn write_storage_command(
        &mut self,
        verb: &str,
        key: &[u8],
        flags: u32,
        expire: i64,
        value: &[u8],
        cas: Option<u64>,
        noreply: bool,
    ) {
        let cas_part = cas.map(|c| format!(" {}", c)).unwrap_or_default();
        let noreply_part = if noreply { " noreply" } else { "" };
        let header = format!(
            "{} {} {} {} {}{}{}\r\n",
            verb,
            String::from_utf8_lossy(key),
            flags,
            expire,
            value.len(),
            cas_part,
            noreply_part,
        );
        let total = header.len() + value.len() + 2;
        let mut bw = self.buffers.bulk_write(total);
        bw.add(header.as_bytes()).add(value).add(b"\r\n");
    }

    pub fn set<F>(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32, on_store: F) -> Result<(), Error>
    where
        F: FnOnce(StoreResult) + Send + 'static,
    {
        self.write_storage_command("set", key, flags, expire, value, None, false);
        self.enqueue(ResponseDescriptor::Store {
            on_store: Box::new(on_store),
            on_error: None,
        })
    }

    pub fn set_noreply(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32) -> Result<(), Error> {
        self.write_storage_command("set", key, flags, expire, value, None, true);
        Ok(())
    }

    pub fn set_cas<F>(
        &mut self,
        key: &[u8],
        value: &[u8],
        expire: i64,
        flags: u32,
        cas_id: u64,
        on_store: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(StoreResult) + Send + 'static,
    {
        self.write_storage_command("cas", key, flags, expire, value, Some(cas_id), false);
        self.enqueue(ResponseDescriptor::Store {
            on_store: Box::new(on_store),
            on_error: None,
        })
    }

    pub fn set_cas_noreply(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32, cas_id: u64) -> Result<(), Error> {
        self.write_storage_command("cas", key, flags, expire, value, Some(cas_id), true);
        Ok(())
    }

    pub fn set_add<F>(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32, on_store: F) -> Result<(), Error>
    where
        F: FnOnce(StoreResult) + Send + 'static,
    {
        self.write_storage_command("add", key, flags, expire, value, None, false);
        self.enqueue(ResponseDescriptor::Store {
            on_store: Box::new(on_store),
            on_error: None,
        })
    }

    pub fn set_add_noreply(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32) -> Result<(), Error> {
        self.write_storage_command("add", key, flags, expire, value, None, true);
        Ok(())
    }

    pub fn set_replace<F>(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32, on_store: F) -> Result<(), Error>
    where
        F: FnOnce(StoreResult) + Send + 'static,
    {
        self.write_storage_command("replace", key, flags, expire, value, None, false);
        self.enqueue(ResponseDescriptor::Store {
            on_store: Box::new(on_store),
            on_error: None,
        })
    }

    pub fn set_replace_noreply(&mut self, key: &[u8], value: &[u8], expire: i64, flags: u32) -> Result<(), Error> {
        self.write_storage_command("replace", key, flags, expire, value, None, true);
        Ok(())
    }

    fn write_append_command(&mut self, verb: &str, key: &[u8], value: &[u8], noreply: bool) {
        let noreply_part = if noreply { " noreply" } else { "" };
        let header = format!(
            "{} {} 0 0 {}{}\r\n",
            verb,
            String::from_utf8_lossy(key),
            value.len(),
            noreply_part,
        );
        let total = header.len() + value.len() + 2;
        let mut bw = self.buffers.bulk_write(total);
        bw.add(header.as_bytes()).add(value).add(b"\r\n");
    }

    pub fn set_append<F>(&mut self, key: &[u8], value: &[u8], on_store: F) -> Result<(), Error>
    where
        F: FnOnce(StoreResult) + Send + 'static,
    {
        self.write_append_command("append", key, value, false);
        self.enqueue(ResponseDescriptor::Store {
            on_store: Box::new(on_store),
            on_error: None,
        })
    }

    pub fn set_append_noreply(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.write_append_command("append", key, value, true);
        Ok(())
    }

    // Note: the original source's debug log for this request prints
    // "set_append" here too; preserved as a flagged, not corrected,
    // oddity rather than guessed at.
    pub fn set_prepend<F>(&mut self, key: &[u8], value: &[u8], on_store: F) -> Result<(), Error>
    where
        F: FnOnce(StoreResult) + Send + 'static,
    {
        trace!(client_id = self.id, "set_append"); // [sic] mirrors the source's mislabeled debug string
        self.write_append_command("prepend", key, value, false);
        self.enqueue(ResponseDescriptor::Store {
            on_store: Box::new(on_store),
            on_error: None,
        })
    }

    pub fn set_prepend_noreply(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        trace!(client_id = self.id, "set_append"); // [sic] mirrors the source's mislabeled debug string
        self.write_append_command("prepend", key, value, true);
        Ok(())
    }

    fn write_incr_command(&mut self, verb: &str, key: &[u8], count: u64, noreply: bool) {
        let noreply_part = if noreply { " noreply" } else { "" };
        let line = format!("{} {} {}{}\r\n", verb, String::from_utf8_lossy(key), count, noreply_part);
        let mut bw = self.buffers.bulk_write(line.len());
        bw.add(line.as_bytes());
    }

    pub fn incr<F>(&mut self, key: &[u8], count: u64, on_increment: F) -> Result<(), Error>
    where
        F: FnOnce(Option<u64>) + Send + 'static,
    {
        self.write_incr_command("incr", key, count, false);
        self.enqueue(ResponseDescriptor::Increment {
            on_increment: Box::new(on_increment),
            on_error: None,
        })
    }

    pub fn incr_noreply(&mut self, key: &[u8], count: u64) -> Result<(), Error> {
        self.write_incr_command("incr", key, count, true);
        Ok(())
    }

    pub fn decr<F>(&mut self, key: &[u8], count: u64, on_increment: F) -> Result<(), Error>
    where
        F: FnOnce(Option<u64>) + Send + 'static,
    {
        self.write_incr_command("decr", key, count, false);
        self.enqueue(ResponseDescriptor::Increment {
            on_increment: Box::new(on_increment),
            on_error: None,
        })
    }

    pub fn decr_noreply(&mut self, key: &[u8], count: u64) -> Result<(), Error> {
        self.write_incr_command("decr", key, count, true);
        Ok(())
    }

    fn write_delete_command(&mut self, key: &[u8], noreply: bool) {
        let noreply_part = if noreply { " noreply" } else { "" };
        let line = format!("delete {}{}\r\n", String::from_utf8_lossy(key), noreply_part);
        let mut bw = self.buffers.bulk_write(line.len());
        bw.add(line.as_bytes());
    }

    pub fn remove<F>(&mut self, key: &[u8], on_remove: F) -> Result<(), Error>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.write_delete_command(key, false);
        self.enqueue(ResponseDescriptor::Remove {
            on_remove: Box::new(on_remove),
            on_error: None,
        })
    }

    pub fn remove_noreply(&mut self, key: &[u8]) -> Result<(), Error> {
        self.write_delete_command(key, true);
        Ok(())
    }

    fn write_touch_command(&mut self, key: &[u8], expire: i64, noreply: bool) {
        let noreply_part = if noreply { " noreply" } else { "" };
        let line = format!("touch {} {}{}\r\n", String::from_utf8_lossy(key), expire, noreply_part);
        let mut bw = self.buffers.bulk_write(line.len());
        bw.add(line.as_bytes());
    }

    pub fn touch<F>(&mut self, key: &[u8], expire: i64, on_touch: F) -> Result<(), Error>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.write_touch_command(key, expire, false);
        self.enqueue(ResponseDescriptor::Touch {
            on_touch: Box::new(on_touch),
            on_error: None,
        })
    }

    pub fn touch_noreply(&mut self, key: &[u8], expire: i64) -> Result<(), Error> {
        self.write_touch_command(key, expire, true);
        Ok(())
    }

    fn write_get_command(&mut self, verb: &str, keys: &[&[u8]], gat_expire: Option<i64>) {
        let mut line = String::from(verb);
        if let Some(expire) = gat_expire {
            line.push(' ');
            line.push_str(&expire.to_string());
        }
        for key in keys {
            line.push(' ');
            line.push_str(&String::from_utf8_lossy(key));
        }
        line.push_str("\r\n");
        let mut bw = self.buffers.bulk_write(line.len());
        bw.add(line.as_bytes());
    }

    /// Issues a `get` for one or more keys. `track_notfound`, if set,
    /// causes `on_get_end` to receive the space-joined list of keys that
    /// were not present in the response, in original order.
    pub fn get<F, E>(&mut self, keys: &[&[u8]], track_notfound: bool, mut on_get: F, on_get_end: E) -> Result<(), Error>
    where
        F: FnMut(Vec<u8>, Vec<u8>, u32) + Send + 'static,
        E: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.write_get_command("get", keys, None);
        let owned_keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let seen = vec![false; owned_keys.len()];
        self.enqueue(ResponseDescriptor::Get(GetDescriptor {
            keys: owned_keys,
            seen,
            track_notfound,
            on_get: Box::new(move |k, v, f, _cas| on_get(k, v, f)),
            on_get_end: Some(Box::new(on_get_end)),
        }))
    }

    pub fn get_cas<F, E>(&mut self, keys: &[&[u8]], track_notfound: bool, on_get: F, on_get_end: E) -> Result<(), Error>
    where
        F: FnMut(Vec<u8>, Vec<u8>, u32, Option<u64>) + Send + 'static,
        E: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.write_get_command("gets", keys, None);
        let owned_keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let seen = vec![false; owned_keys.len()];
        self.enqueue(ResponseDescriptor::Get(GetDescriptor {
            keys: owned_keys,
            seen,
            track_notfound,
            on_get: Box::new(on_get),
            on_get_end: Some(Box::new(on_get_end)),
        }))
    }

    pub fn get_touch<F, E>(&mut self, expire: i64, keys: &[&[u8]], track_notfound: bool, mut on_get: F, on_get_end: E) -> Result<(), Error>
    where
        F: FnMut(Vec<u8>, Vec<u8>, u32) + Send + 'static,
        E: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.write_get_command("gat", keys, Some(expire));
        let owned_keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let seen = vec![false; owned_keys.len()];
        self.enqueue(ResponseDescriptor::Get(GetDescriptor {
            keys: owned_keys,
            seen,
            track_notfound,
            on_get: Box::new(move |k, v, f, _cas| on_get(k, v, f)),
            on_get_end: Some(Box::new(on_get_end)),
        }))
    }

    pub fn get_touch_cas<F, E>(&mut self, expire: i64, keys: &[&[u8]], track_notfound: bool, on_get: F, on_get_end: E) -> Result<(), Error>
    where
        F: FnMut(Vec<u8>, Vec<u8>, u32, Option<u64>) + Send + 'static,
        E: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.write_get_command("gats", keys, Some(expire));
        let owned_keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let seen = vec![false; owned_keys.len()];
        self.enqueue(ResponseDescriptor::Get(GetDescriptor {
            keys: owned_keys,
            seen,
            track_notfound,
            on_get: Box::new(on_get),
            on_get_end: Some(Box::new(on_get_end)),
        }))
    }

    /// See [`crate::expire::calc_expire_time`].
    pub fn calc_expire_time(&self, seconds: i64, base: i64) -> i64 {
        crate::expire::calc_expire_time(seconds, base)
    }

    // -- response parsing -------------------------------------------------

    pub async fn flush(&mut self) -> Result<(), Error> {
        let mut conn = self.conn.take().ok_or(Error::Closed)?;
        let result = self.buffers.flush(&mut conn).await;
        self.conn = Some(conn);
        result
    }

    /// Reads and dispatches exactly one unit of response (one non-`VALUE`
    /// line, or one `VALUE ... \r\n<body>\r\n` pair).
    async fn poll_one(&mut self) -> Result<(), Error> {
        let mut conn = self.conn.take().ok_or(Error::Closed)?;
        let outcome = self.poll_one_inner(&mut conn).await;
        self.conn = Some(conn);
        outcome
    }

    async fn poll_one_inner(&mut self, conn: &mut C) -> Result<(), Error> {
        match std::mem::replace(&mut self.parse_state, ParserState::ExpectingReply) {
            ParserState::ExpectingReply => {
                let line = self.buffers.read_line_helper(conn).await?;
                self.buffers.read_flush();
                self.handle_reply_line(&line)
            }
            ParserState::ReadingValueBody { key, flags, size, cas } => {
                let body = self.buffers.read_fixed_helper(conn, size + 2).await?;
                self.buffers.read_flush();
                let value = body[..size].to_vec();
                self.dispatch_value(key, value, flags, cas);
                Ok(())
            }
        }
    }

    fn handle_reply_line(&mut self, line: &[u8]) -> Result<(), Error> {
        if line.starts_with(b"VALUE ") {
            return self.handle_value_header(line);
        }
        if line == b"END" {
            return self.handle_get_end();
        }

        let descriptor = self
            .queue
            .pop_front()
            .ok_or_else(|| Error::Protocol("response with no matching request".into()))?;

        if line.starts_with(b"ERROR") || line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR") {
            let err = Error::Protocol(String::from_utf8_lossy(line).into_owned());
            self.dispatch_error(descriptor, err);
            return Ok(());
        }

        match descriptor {
            ResponseDescriptor::Store { on_store, .. } => {
                let result = match line {
                    b"STORED" => StoreResult::Stored,
                    b"NOT_STORED" => StoreResult::NotStored,
                    b"EXISTS" => StoreResult::Exists,
                    b"NOT_FOUND" => StoreResult::NotFound,
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected store reply: {}",
                            String::from_utf8_lossy(other)
                        )))
                    }
                };
                on_store(result);
                Ok(())
            }
            ResponseDescriptor::Increment { on_increment, .. } => {
                if line == b"NOT_FOUND" {
                    on_increment(None);
                    return Ok(());
                }
                let value = std::str::from_utf8(line)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::Protocol("unparsable incr/decr reply".into()))?;
                on_increment(Some(value));
                Ok(())
            }
            ResponseDescriptor::Remove { on_remove, .. } => {
                match line {
                    b"DELETED" => on_remove(true),
                    b"NOT_FOUND" => on_remove(false),
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected delete reply: {}",
                            String::from_utf8_lossy(other)
                        )))
                    }
                }
                Ok(())
            }
            ResponseDescriptor::Touch { on_touch, .. } => {
                match line {
                    b"TOUCHED" => on_touch(true),
                    b"NOT_FOUND" => on_touch(false),
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected touch reply: {}",
                            String::from_utf8_lossy(other)
                        )))
                    }
                }
                Ok(())
            }
            ResponseDescriptor::Get(_) => Err(Error::Protocol(
                "expected VALUE/END while a Get is outstanding".into(),
            )),
        }
    }

    fn handle_value_header(&mut self, line: &[u8]) -> Result<(), Error> {
        if !matches!(self.queue.front(), Some(ResponseDescriptor::Get(_))) {
            return Err(Error::Protocol("VALUE with no outstanding get".into()));
        }
        let text = std::str::from_utf8(line).map_err(|_| Error::Protocol("VALUE header not utf8".into()))?;
        let mut tokens = text.split_whitespace();
        tokens.next(); // "VALUE"
        let key = tokens
            .next()
            .ok_or_else(|| Error::Protocol("VALUE missing key".into()))?
            .as_bytes()
            .to_vec();
        let flags: u32 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| Error::Protocol("VALUE missing/invalid flags".into()))?;
        let size: usize = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| Error::Protocol("VALUE missing/invalid size".into()))?;
        let cas = tokens.next().and_then(|t| t.parse().ok());

        if let Some(ResponseDescriptor::Get(get)) = self.queue.front_mut() {
            if let Some(idx) = get.keys.iter().position(|k| k == &key) {
                get.seen[idx] = true;
            }
        }

        self.parse_state = ParserState::ReadingValueBody { key, flags, size, cas };
        Ok(())
    }

    fn dispatch_value(&mut self, key: Vec<u8>, value: Vec<u8>, flags: u32, cas: Option<u64>) {
        if let Some(ResponseDescriptor::Get(get)) = self.queue.front_mut() {
            (get.on_get)(key, value, flags, cas);
        }
    }

    fn handle_get_end(&mut self) -> Result<(), Error> {
        let descriptor = self
            .queue
            .pop_front()
            .ok_or_else(|| Error::Protocol("END with no outstanding get".into()))?;
        match descriptor {
            ResponseDescriptor::Get(get) => {
                let not_found = if get.track_notfound {
                    let missing: Vec<&[u8]> = get
                        .keys
                        .iter()
                        .zip(get.seen.iter())
                        .filter(|(_, seen)| !**seen)
                        .map(|(k, _)| k.as_slice())
                        .collect();
                    join_keys(&missing)
                } else {
                    vec![]
                };
                if let Some(on_end) = get.on_get_end {
                    on_end(not_found);
                }
                Ok(())
            }
            other => {
                // Put it back; this wasn't ours to consume.
                self.queue.push_front(other);
                Err(Error::Protocol("END received without a pending get".into()))
            }
        }
    }

    fn dispatch_error(&mut self, mut descriptor: ResponseDescriptor, err: Error) {
        warn!(client_id = self.id, "protocol error reply: {}", err);
        if let Some(on_error) = descriptor.take_on_error() {
            on_error(err);
        } else if let Some(global) = self.on_error.as_mut() {
            global(&err);
        }
        self.fail_all_queued(err);
    }

    /// Flushes the write buffer and reads responses until both the write
    /// buffer and the response queue are empty.
    pub async fn run_local(&mut self) -> Result<(), Error> {
        self.flush().await?;
        while !self.queue.is_empty() || !matches!(self.parse_state, ParserState::ExpectingReply) {
            if let Err(err) = self.poll_one().await {
                error!(client_id = self.id, "client error: {}", err);
                if let Some(global) = self.on_error.as_mut() {
                    global(&err);
                }
                self.close();
                return Err(err);
            }
        }
        Ok(())
    }
}

fn join_keys(keys: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(key);
    }
    out
}
