//! The server-side command parser/dispatcher: reads commands off the
//! wire, invokes handler events, and routes handler results (immediate /
//! deferred / handled / close) through the [`reorder::ReplyReorderer`].

pub mod deferred;
pub mod reorder;

pub use deferred::{DeferredContext, DeferredReply, ErrorReplyKind};
pub use reorder::ReplyReorderer;

use crate::buffers::{AsyncBuffers, Connection};
use crate::client::StoreResult;
use crate::config::ServerConfig;
use crate::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A handler event's result: either the framework should format and send
/// the canonical response for a plain value (`Normal`), the handler has
/// already constructed exactly one `DeferredReply` and will complete it
/// later (`Deferred`), the handler already wrote its own response
/// (`Handled`), or the connection should be torn down (`Close`).
pub enum ResponseResult<T> {
    Normal(T),
    Deferred,
    Handled,
    Close,
}

impl<T> From<T> for ResponseResult<T> {
    fn from(value: T) -> Self {
        ResponseResult::Normal(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub command: StoreCommand,
    pub key: Vec<u8>,
    pub flags: u32,
    pub expire: i64,
    pub value: Vec<u8>,
    pub cas_id: Option<u64>,
    pub noreply: bool,
}

#[derive(Debug, Clone)]
pub struct GetValue {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas_id: Option<u64>,
}

/// Handle passed to every deferrable handler event: `defer()` constructs
/// the one permitted `DeferredReply`; the `send_*` helpers let a handler
/// that returns `Handled` write a custom response directly.
#[derive(Clone)]
pub struct ReplyContext {
    reorderer: Arc<Mutex<ReplyReorderer>>,
    deferred_context: DeferredContext,
    id: u64,
    deferred_created: Arc<AtomicU32>,
}

impl ReplyContext {
    fn new(reorderer: Arc<Mutex<ReplyReorderer>>, deferred_context: DeferredContext, id: u64) -> Self {
        Self {
            reorderer,
            deferred_context,
            id,
            deferred_created: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Constructs the single `DeferredReply` a handler is permitted to
    /// create per event when it returns `ResponseResult::Deferred`.
    pub fn defer(&self) -> DeferredReply {
        self.deferred_created.fetch_add(1, Ordering::SeqCst);
        DeferredReply::new(self.deferred_context.clone(), self.id)
    }

    pub fn send_reply(&self, msg: &str) {
        self.reorderer.lock().unwrap().send(self.id, format!("{}\r\n", msg).as_bytes());
    }

    pub fn send_client_error(&self, msg: &str) {
        self.reorderer.lock().unwrap().send(self.id, format!("CLIENT_ERROR {}\r\n", msg).as_bytes());
    }

    pub fn send_error(&self, msg: &str) {
        self.reorderer.lock().unwrap().send(self.id, format!("SERVER_ERROR {}\r\n", msg).as_bytes());
    }

    pub fn send_stat(&self, name: &str, value: &str) {
        self.reorderer.lock().unwrap().send(self.id, format!("STAT {} {}\r\n", name, value).as_bytes());
    }

    pub fn send_value(&self, key: &[u8], value: &[u8], flags: u32, cas_id: Option<u64>) {
        self.reorderer.lock().unwrap().send(self.id, &format_value(key, value, flags, cas_id));
    }

    fn created_count(&self) -> u32 {
        self.deferred_created.load(Ordering::SeqCst)
    }
}

fn format_value(key: &[u8], value: &[u8], flags: u32, cas_id: Option<u64>) -> Vec<u8> {
    let mut out = match cas_id {
        Some(cas) => format!("VALUE {} {} {} {}\r\n", String::from_utf8_lossy(key), flags, value.len(), cas),
        None => format!("VALUE {} {} {}\r\n", String::from_utf8_lossy(key), flags, value.len()),
    }
    .into_bytes();
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
    out
}

/// User-supplied request handler. Every event has a default
/// implementation so a handler only needs to override the commands it
/// cares about; the backing store (and eviction/persistence policy) is
/// entirely the implementor's responsibility.
pub trait MemcachedHandler: Send {
    fn on_store(&mut self, req: StoreRequest, ctx: ReplyContext) -> ResponseResult<StoreResult> {
        let _ = (req, ctx);
        ResponseResult::Normal(StoreResult::NotStored)
    }

    fn on_increment(&mut self, key: &[u8], delta: u64, incr: bool, noreply: bool, ctx: ReplyContext) -> ResponseResult<Option<u64>> {
        let _ = (key, delta, incr, noreply, ctx);
        ResponseResult::Normal(None)
    }

    fn on_delete(&mut self, key: &[u8], noreply: bool, ctx: ReplyContext) -> ResponseResult<bool> {
        let _ = (key, noreply, ctx);
        ResponseResult::Normal(false)
    }

    fn on_touch(&mut self, key: &[u8], expire: i64, noreply: bool, ctx: ReplyContext) -> ResponseResult<bool> {
        let _ = (key, expire, noreply, ctx);
        ResponseResult::Normal(false)
    }

    fn on_get_start(&mut self, keys: &[Vec<u8>], gat_expire: Option<i64>, ctx: ReplyContext) -> ResponseResult<()> {
        let _ = (keys, gat_expire, ctx);
        ResponseResult::Normal(())
    }

    fn on_get(&mut self, key: &[u8], gat_expire: Option<i64>) -> Option<GetValue> {
        let _ = (key, gat_expire);
        None
    }

    fn on_get_end(&mut self) {}

    fn on_stats(&mut self, params: &[u8], ctx: ReplyContext) -> ResponseResult<()> {
        let _ = (params, ctx);
        ResponseResult::Normal(())
    }

    fn on_flush_all(&mut self, params: &[u8], ctx: ReplyContext) -> ResponseResult<()> {
        let _ = (params, ctx);
        ResponseResult::Normal(())
    }

    fn on_version(&mut self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Catch-all for commands outside the known set. Default replies
    /// `ERROR\r\n`.
    fn on_command(&mut self, cmd: &[u8], params: &[u8], ctx: ReplyContext) -> ResponseResult<()> {
        let _ = (cmd, params);
        ctx.send_reply("ERROR");
        ResponseResult::Handled
    }

    fn on_quit(&mut self) {}
}

fn check_deferred_contract(is_deferred: bool, created: u32, noreply: bool) -> Result<(), Error> {
    if is_deferred && noreply {
        return Err(Error::HandlerContract("noreply combined with a deferred response".into()));
    }
    if is_deferred && created != 1 {
        return Err(Error::HandlerContract(format!(
            "rtDEFERRED requires exactly one DeferredReply to be constructed, got {}",
            created
        )));
    }
    if !is_deferred && created != 0 {
        return Err(Error::HandlerContract(
            "a DeferredReply was constructed without returning rtDEFERRED".into(),
        ));
    }
    Ok(())
}

fn split_tokens(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect()
}

fn parse_u64(tok: &[u8]) -> Option<u64> {
    std::str::from_utf8(tok).ok()?.parse().ok()
}

fn parse_i64(tok: &[u8]) -> Option<i64> {
    std::str::from_utf8(tok).ok()?.parse().ok()
}

fn parse_u32(tok: &[u8]) -> Option<u32> {
    std::str::from_utf8(tok).ok()?.parse().ok()
}

/// A single Memcached connection on the server side: owns the socket,
/// the read/write buffers, the reply reorderer, and the deferred-reply
/// context; drives a user-supplied [`MemcachedHandler`].
pub struct MemcachedServerConn<C: Connection, H: MemcachedHandler> {
    conn: C,
    buffers: AsyncBuffers,
    reorderer: Arc<Mutex<ReplyReorderer>>,
    deferred_context: DeferredContext,
    handler: H,
    config: ServerConfig,
    should_close: bool,
}

impl<C: Connection, H: MemcachedHandler> MemcachedServerConn<C, H> {
    pub fn new(conn: C, handler: H, config: ServerConfig) -> Self {
        let reorderer = Arc::new(Mutex::new(ReplyReorderer::new()));
        let deferred_context = DeferredContext::new(reorderer.clone());
        Self {
            conn,
            buffers: AsyncBuffers::new(4096, config.max_initial_read),
            reorderer,
            deferred_context,
            handler,
            config,
            should_close: false,
        }
    }

    /// Drives the connection until the peer closes, an unrecoverable
    /// error occurs, or a handler returns `Close`/`quit` is received.
    pub async fn serve(&mut self) -> Result<(), Error> {
        loop {
            let line = match self.buffers.read_line_helper(&mut self.conn).await {
                Ok(line) => line,
                Err(Error::Closed) => break,
                Err(err) => return Err(err),
            };
            self.buffers.read_flush();
            let line = line.to_vec();

            if let Err(err) = self.handle_line(line).await {
                warn!("protocol error, closing connection: {}", err);
                self.flush_wire().await.ok();
                return Err(err);
            }
            self.flush_wire().await?;
            if self.should_close {
                break;
            }
        }
        self.deferred_context.detach();
        Ok(())
    }

    async fn flush_wire(&mut self) -> Result<(), Error> {
        let bytes = self.reorderer.lock().unwrap().take_ready_bytes();
        if !bytes.is_empty() {
            self.buffers.write_raw(&bytes);
        }
        self.buffers.flush(&mut self.conn).await
    }

    fn next_id(&self) -> u64 {
        self.reorderer.lock().unwrap().gen_id()
    }

    fn reply_context(&self, id: u64) -> ReplyContext {
        ReplyContext::new(self.reorderer.clone(), self.deferred_context.clone(), id)
    }

    async fn handle_line(&mut self, line: Vec<u8>) -> Result<(), Error> {
        let tokens = split_tokens(&line);
        let command = match tokens.first() {
            Some(c) => *c,
            None => return Ok(()),
        };

        match command {
            b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
                self.handle_storage(command, &tokens).await
            }
            b"incr" | b"decr" => self.handle_incr_decr(command, &tokens),
            b"delete" => self.handle_delete(&tokens),
            b"touch" => self.handle_touch(&tokens),
            b"get" | b"gets" | b"gat" | b"gats" => self.handle_get(command, &tokens),
            b"stats" => self.handle_stats(&tokens),
            b"flush_all" => self.handle_flush_all(&tokens),
            b"version" => {
                let id = self.next_id();
                let v = self.handler.on_version();
                self.reorderer.lock().unwrap().send(id, format!("VERSION {}\r\n", v).as_bytes());
                Ok(())
            }
            b"quit" => {
                self.handler.on_quit();
                self.should_close = true;
                Ok(())
            }
            other => {
                let id = self.next_id();
                let ctx = self.reply_context(id);
                let params = line[other.len().min(line.len())..].to_vec();
                let result = self.handler.on_command(other, &params, ctx.clone());
                let created = ctx.created_count();
                check_deferred_contract(matches!(result, ResponseResult::Deferred), created, false)?;
                if let ResponseResult::Close = result {
                    self.should_close = true;
                }
                Ok(())
            }
        }
    }

    async fn handle_storage(&mut self, command: &[u8], tokens: &[&[u8]]) -> Result<(), Error> {
        let store_cmd = match command {
            b"set" => StoreCommand::Set,
            b"add" => StoreCommand::Add,
            b"replace" => StoreCommand::Replace,
            b"append" => StoreCommand::Append,
            b"prepend" => StoreCommand::Prepend,
            b"cas" => StoreCommand::Cas,
            _ => unreachable!(),
        };

        if store_cmd == StoreCommand::Cas && !self.config.enable_cas {
            let id = self.next_id();
            self.reorderer.lock().unwrap().send(id, b"SERVER_ERROR Not implemented\r\n");
            return Ok(());
        }

        let key = match tokens.get(1) {
            Some(k) if !k.is_empty() => k.to_vec(),
            _ => {
                let id = self.next_id();
                self.reorderer.lock().unwrap().send(id, b"CLIENT_ERROR bad command line format\r\n");
                return Ok(());
            }
        };
        let flags = tokens.get(2).and_then(|t| parse_u32(t)).unwrap_or(0);
        let expire = tokens.get(3).and_then(|t| parse_i64(t)).unwrap_or(0);
        let bytes = match tokens.get(4).and_then(|t| parse_u64(t)) {
            Some(n) => n as usize,
            None => {
                let id = self.next_id();
                self.reorderer.lock().unwrap().send(id, b"CLIENT_ERROR bad command line format\r\n");
                return Ok(());
            }
        };

        let (cas_id, noreply_idx) = if store_cmd == StoreCommand::Cas {
            (tokens.get(5).and_then(|t| parse_u64(t)), 6)
        } else {
            (None, 5)
        };
        let noreply = tokens.get(noreply_idx) == Some(&&b"noreply"[..]);

        let body = self.buffers.read_fixed_helper(&mut self.conn, bytes + 2).await?;
        self.buffers.read_flush();
        let value = body[..bytes].to_vec();

        let id = self.next_id();
        if noreply {
            self.reorderer.lock().unwrap().nosend(id);
        }
        let ctx = self.reply_context(id);
        let req = StoreRequest {
            command: store_cmd,
            key,
            flags,
            expire,
            value,
            cas_id,
            noreply,
        };
        let result = self.handler.on_store(req, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, noreply)?;

        if !noreply {
            match result {
                ResponseResult::Normal(r) => {
                    let line: &[u8] = match r {
                        StoreResult::Stored => b"STORED\r\n",
                        StoreResult::NotStored => b"NOT_STORED\r\n",
                        StoreResult::Exists => b"EXISTS\r\n",
                        StoreResult::NotFound => b"NOT_FOUND\r\n",
                    };
                    self.reorderer.lock().unwrap().send(id, line);
                }
                ResponseResult::Deferred | ResponseResult::Handled => {}
                ResponseResult::Close => self.should_close = true,
            }
        }
        Ok(())
    }

    fn handle_incr_decr(&mut self, command: &[u8], tokens: &[&[u8]]) -> Result<(), Error> {
        let incr = command == b"incr";
        let key = match tokens.get(1) {
            Some(k) => k.to_vec(),
            None => return self.reply_client_error("bad command line format"),
        };
        let delta = match tokens.get(2).and_then(|t| parse_u64(t)) {
            Some(d) => d,
            None => return self.reply_client_error("invalid numeric delta argument"),
        };
        let noreply = tokens.get(3) == Some(&&b"noreply"[..]);

        let id = self.next_id();
        if noreply {
            self.reorderer.lock().unwrap().nosend(id);
        }
        let ctx = self.reply_context(id);
        let result = self.handler.on_increment(&key, delta, incr, noreply, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, noreply)?;

        if !noreply {
            match result {
                ResponseResult::Normal(Some(v)) => {
                    self.reorderer.lock().unwrap().send(id, format!("{}\r\n", v).as_bytes());
                }
                ResponseResult::Normal(None) => {
                    self.reorderer.lock().unwrap().send(id, b"NOT_FOUND\r\n");
                }
                ResponseResult::Deferred | ResponseResult::Handled => {}
                ResponseResult::Close => self.should_close = true,
            }
        }
        Ok(())
    }

    fn handle_delete(&mut self, tokens: &[&[u8]]) -> Result<(), Error> {
        let key = match tokens.get(1) {
            Some(k) => k.to_vec(),
            None => return self.reply_client_error("bad command line format"),
        };
        let noreply = tokens.get(2) == Some(&&b"noreply"[..]);

        let id = self.next_id();
        if noreply {
            self.reorderer.lock().unwrap().nosend(id);
        }
        let ctx = self.reply_context(id);
        let result = self.handler.on_delete(&key, noreply, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, noreply)?;

        if !noreply {
            match result {
                ResponseResult::Normal(found) => {
                    self.reorderer
                        .lock()
                        .unwrap()
                        .send(id, if found { b"DELETED\r\n" } else { b"NOT_FOUND\r\n" });
                }
                ResponseResult::Deferred | ResponseResult::Handled => {}
                ResponseResult::Close => self.should_close = true,
            }
        }
        Ok(())
    }

    fn handle_touch(&mut self, tokens: &[&[u8]]) -> Result<(), Error> {
        let key = match tokens.get(1) {
            Some(k) => k.to_vec(),
            None => return self.reply_client_error("bad command line format"),
        };
        let expire = match tokens.get(2).and_then(|t| parse_i64(t)) {
            Some(e) => e,
            None => return self.reply_client_error("invalid exptime argument"),
        };
        let noreply = tokens.get(3) == Some(&&b"noreply"[..]);

        let id = self.next_id();
        if noreply {
            self.reorderer.lock().unwrap().nosend(id);
        }
        let ctx = self.reply_context(id);
        let result = self.handler.on_touch(&key, expire, noreply, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, noreply)?;

        if !noreply {
            match result {
                ResponseResult::Normal(found) => {
                    self.reorderer
                        .lock()
                        .unwrap()
                        .send(id, if found { b"TOUCHED\r\n" } else { b"NOT_FOUND\r\n" });
                }
                ResponseResult::Deferred | ResponseResult::Handled => {}
                ResponseResult::Close => self.should_close = true,
            }
        }
        Ok(())
    }

    fn handle_get(&mut self, command: &[u8], tokens: &[&[u8]]) -> Result<(), Error> {
        let is_gat = command == b"gat" || command == b"gats";
        let wants_cas = command == b"gets" || command == b"gats";

        if wants_cas && !self.config.enable_cas {
            let id = self.next_id();
            self.reorderer.lock().unwrap().send(id, b"SERVER_ERROR Not implemented\r\n");
            return Ok(());
        }
        if is_gat && !self.config.enable_gat {
            let id = self.next_id();
            self.reorderer.lock().unwrap().send(id, b"SERVER_ERROR Not implemented\r\n");
            return Ok(());
        }

        let mut rest = &tokens[1..];
        let gat_expire = if is_gat {
            let expire = match rest.first().and_then(|t| parse_i64(t)) {
                Some(e) => e,
                None => return self.reply_client_error("bad command line format"),
            };
            rest = &rest[1..];
            Some(expire)
        } else {
            None
        };
        let keys: Vec<Vec<u8>> = rest.iter().map(|k| k.to_vec()).collect();
        if keys.is_empty() {
            return self.reply_client_error("bad command line format");
        }

        let id = self.next_id();
        let ctx = self.reply_context(id);
        let result = self.handler.on_get_start(&keys, gat_expire, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, false)?;

        match result {
            ResponseResult::Normal(()) => {
                let mut buf = Vec::new();
                for key in &keys {
                    if let Some(value) = self.handler.on_get(key, gat_expire) {
                        buf.extend_from_slice(&format_value(key, &value.value, value.flags, value.cas_id));
                    }
                }
                self.handler.on_get_end();
                buf.extend_from_slice(b"END\r\n");
                self.reorderer.lock().unwrap().send(id, &buf);
            }
            ResponseResult::Deferred | ResponseResult::Handled => {}
            ResponseResult::Close => self.should_close = true,
        }
        Ok(())
    }

    fn handle_stats(&mut self, tokens: &[&[u8]]) -> Result<(), Error> {
        let params: Vec<u8> = tokens[1..].join(&b' ');
        let id = self.next_id();
        let ctx = self.reply_context(id);
        let result = self.handler.on_stats(&params, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, false)?;
        match result {
            ResponseResult::Normal(()) => {
                self.reorderer.lock().unwrap().send(id, b"END\r\n");
            }
            ResponseResult::Deferred | ResponseResult::Handled => {}
            ResponseResult::Close => self.should_close = true,
        }
        Ok(())
    }

    fn handle_flush_all(&mut self, tokens: &[&[u8]]) -> Result<(), Error> {
        let params: Vec<u8> = tokens[1..].join(&b' ');
        let id = self.next_id();
        let ctx = self.reply_context(id);
        let result = self.handler.on_flush_all(&params, ctx.clone());
        let created = ctx.created_count();
        check_deferred_contract(matches!(result, ResponseResult::Deferred), created, false)?;
        match result {
            ResponseResult::Normal(()) => {
                self.reorderer.lock().unwrap().send(id, b"OK\r\n");
            }
            ResponseResult::Deferred | ResponseResult::Handled => {}
            ResponseResult::Close => self.should_close = true,
        }
        Ok(())
    }

    fn reply_client_error(&mut self, msg: &str) -> Result<(), Error> {
        let id = self.next_id();
        self.reorderer
            .lock()
            .unwrap()
            .send(id, format!("CLIENT_ERROR {}\r\n", msg).as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::Connection;
    use bytes::BytesMut;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    struct FakeConn {
        inbound: VecDeque<Vec<u8>>,
        outbound: Arc<StdMutex<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Connection for FakeConn {
        async fn connect(_addr: String) -> Result<Self, Error> {
            unimplemented!()
        }

        async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
            match self.inbound.pop_front() {
                Some(chunk) => {
                    buf.extend_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
            self.outbound.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoHandler {
        store: std::collections::HashMap<Vec<u8>, (Vec<u8>, u32)>,
    }

    impl MemcachedHandler for EchoHandler {
        fn on_store(&mut self, req: StoreRequest, _ctx: ReplyContext) -> ResponseResult<StoreResult> {
            self.store.insert(req.key, (req.value, req.flags));
            ResponseResult::Normal(StoreResult::Stored)
        }

        fn on_get_start(&mut self, _keys: &[Vec<u8>], _gat_expire: Option<i64>, _ctx: ReplyContext) -> ResponseResult<()> {
            ResponseResult::Normal(())
        }

        fn on_get(&mut self, key: &[u8], _gat_expire: Option<i64>) -> Option<GetValue> {
            self.store.get(key).map(|(v, f)| GetValue {
                value: v.clone(),
                flags: *f,
                cas_id: None,
            })
        }
    }

    fn fake(inbound: Vec<&[u8]>) -> (FakeConn, Arc<StdMutex<Vec<u8>>>) {
        let outbound = Arc::new(StdMutex::new(vec![]));
        (
            FakeConn {
                inbound: inbound.into_iter().map(|c| c.to_vec()).collect(),
                outbound: outbound.clone(),
            },
            outbound,
        )
    }

    #[test]
    fn pipelined_set_get_s1() {
        tokio_test::block_on(async {
            let (conn, outbound) = fake(vec![
                b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\nget a b\r\n".as_ref(),
            ]);
            let mut server = MemcachedServerConn::new(conn, EchoHandler::default(), ServerConfig::default());
            server.serve().await.ok();
            assert_eq!(
                &outbound.lock().unwrap()[..],
                b"STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n"
            );
        });
    }

    #[test]
    fn deferred_out_of_order_preserves_wire_order_s3() {
        struct DeferHandler {
            pending: Arc<StdMutex<Vec<DeferredReply>>>,
        }
        impl MemcachedHandler for DeferHandler {
            fn on_get_start(&mut self, keys: &[Vec<u8>], _gat_expire: Option<i64>, ctx: ReplyContext) -> ResponseResult<()> {
                if keys == [b"first".to_vec()] {
                    self.pending.lock().unwrap().push(ctx.defer());
                    ResponseResult::Deferred
                } else {
                    ResponseResult::Normal(())
                }
            }
            fn on_get(&mut self, _key: &[u8], _gat_expire: Option<i64>) -> Option<GetValue> {
                None
            }
        }

        // Both commands are dispatched synchronously; only the byte
        // ordering on the wire depends on completion order, so this is
        // exercised directly against the dispatcher rather than through
        // the full `serve()` loop.
        let pending = Arc::new(StdMutex::new(vec![]));
        let (conn, _outbound) = fake(vec![]);
        let mut server = MemcachedServerConn::new(
            conn,
            DeferHandler { pending: pending.clone() },
            ServerConfig::default(),
        );

        server.handle_get(b"get", &[b"get".as_ref(), b"first".as_ref()]).unwrap();
        server.handle_get(b"get", &[b"get".as_ref(), b"second".as_ref()]).unwrap();

        assert_eq!(
            server.reorderer.lock().unwrap().take_ready_bytes(),
            b"",
            "first's deferred reply hasn't completed yet, so nothing is ready"
        );

        let reply = pending.lock().unwrap().pop().unwrap();
        reply.deferred_reply_get_end();

        assert_eq!(
            server.reorderer.lock().unwrap().take_ready_bytes(),
            b"END\r\nEND\r\n",
            "first's reply must precede second's even though it completed later"
        );
    }
}
