//! Tokio [`Connection`] implementation for `mctext-core`.

use async_trait::async_trait;
use bytes::BytesMut;
use mctext_core::{Connection, Error};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug)]
pub struct TokioConnection {
    stream: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TokioConnection {
    /// Wraps an already-accepted stream, for the server side of a
    /// listener loop (the client side always goes through `connect`).
    pub fn from_stream(stream: TcpStream) -> Self {
        TokioConnection {
            stream,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[async_trait]
impl Connection for TokioConnection {
    async fn connect(addr: String) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await.map_err(Error::Connect)?;
        Ok(TokioConnection {
            stream,
            read_timeout: None,
            write_timeout: None,
        })
    }

    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        let mut chunk = [0u8; 4096];
        let fut = self.stream.read(&mut chunk);
        let n = match self.read_timeout {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::Timeout)??,
            None => fut.await?,
        };
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let fut = self.stream.write_all(data);
        match self.write_timeout {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(Error::IoWrite),
            None => fut.await.map_err(Error::IoWrite),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctext_core::client::MemcachedClient;
    use mctext_core::config::ClientConfig;
    use mctext_core::server::{
        DeferredReply, GetValue, MemcachedHandler, MemcachedServerConn, ReplyContext,
        ResponseResult, StoreRequest,
    };
    use mctext_core::{ServerConfig, StoreResult};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct MapHandler {
        store: HashMap<Vec<u8>, (Vec<u8>, u32)>,
    }

    impl MemcachedHandler for MapHandler {
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

    async fn spawn_loopback_server<H>(handler: H) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>)
    where
        H: MemcachedHandler + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = TokioConnection::from_stream(stream);
            let mut server = MemcachedServerConn::new(conn, handler, ServerConfig::default());
            server.serve().await.ok();
        });
        (addr, task)
    }

    /// S1: a plain pipelined set/get round trip, client and server each
    /// driven by their own runtime over a real TCP loopback socket.
    #[tokio::test]
    async fn client_and_server_round_trip_over_tcp_loopback_s1() {
        let (addr, server_task) = spawn_loopback_server(MapHandler::default()).await;

        let mut client = MemcachedClient::<TokioConnection>::new(ClientConfig::default());
        client.connect_ip(addr.to_string()).await.unwrap();

        client.set(b"greeting", b"hello", 0, 0, |_| {}).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        client
            .get(
                &[b"greeting"],
                false,
                move |k, v, _flags| seen2.lock().unwrap().push((k, v)),
                |_not_found| {},
            )
            .unwrap();

        client.run_local().await.unwrap();

        assert_eq!(seen.lock().unwrap()[0], (b"greeting".to_vec(), b"hello".to_vec()));

        client.close();
        server_task.await.ok();
    }

    /// S2: a get for a key the server never stored comes back as a miss,
    /// not an error, and doesn't wedge the pipeline behind it.
    #[tokio::test]
    async fn get_of_unknown_key_reports_a_miss_s2() {
        let (addr, server_task) = spawn_loopback_server(MapHandler::default()).await;

        let mut client = MemcachedClient::<TokioConnection>::new(ClientConfig::default());
        client.connect_ip(addr.to_string()).await.unwrap();

        let missed = Arc::new(Mutex::new(Vec::new()));
        let missed2 = missed.clone();
        client
            .get(
                &[b"absent"],
                true,
                |_k, _v, _flags| panic!("unstored key must not be reported as a hit"),
                move |not_found| *missed2.lock().unwrap() = not_found,
            )
            .unwrap();

        client.run_local().await.unwrap();

        assert_eq!(missed.lock().unwrap().as_slice(), b"absent");

        client.close();
        server_task.await.ok();
    }

    struct DeferFirstHandler {
        store: HashMap<Vec<u8>, (Vec<u8>, u32)>,
        pending: Arc<Mutex<Option<DeferredReply>>>,
    }

    impl MemcachedHandler for DeferFirstHandler {
        fn on_store(&mut self, req: StoreRequest, _ctx: ReplyContext) -> ResponseResult<StoreResult> {
            self.store.insert(req.key, (req.value, req.flags));
            ResponseResult::Normal(StoreResult::Stored)
        }

        fn on_get_start(&mut self, keys: &[Vec<u8>], _gat_expire: Option<i64>, ctx: ReplyContext) -> ResponseResult<()> {
            if keys == [b"first".to_vec()] {
                *self.pending.lock().unwrap() = Some(ctx.defer());
                ResponseResult::Deferred
            } else {
                ResponseResult::Normal(())
            }
        }

        fn on_get(&mut self, key: &[u8], _gat_expire: Option<i64>) -> Option<GetValue> {
            self.store.get(key).map(|(v, f)| GetValue {
                value: v.clone(),
                flags: *f,
                cas_id: None,
            })
        }
    }

    /// S3: a get whose reply completes later must still reach the wire,
    /// and the client, ahead of a get issued after it that completed
    /// immediately -- proving wire order follows request order even when
    /// completion order is reversed end to end, not just inside the
    /// in-process reorderer unit test.
    #[tokio::test]
    async fn deferred_get_preserves_request_order_across_a_real_socket_s3() {
        let pending = Arc::new(Mutex::new(None));
        let mut store = HashMap::new();
        store.insert(b"second".to_vec(), (b"second-value".to_vec(), 0));
        let handler = DeferFirstHandler {
            store,
            pending: pending.clone(),
        };
        let (addr, server_task) = spawn_loopback_server(handler).await;

        let completer = tokio::spawn(async move {
            loop {
                if let Some(reply) = pending.lock().unwrap().take() {
                    reply.deferred_reply_get_end();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let mut client = MemcachedClient::<TokioConnection>::new(ClientConfig::default());
        client.connect_ip(addr.to_string()).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        client
            .get(
                &[b"first"],
                false,
                |_k, _v, _flags| panic!("\"first\" was never stored"),
                move |_not_found| order2.lock().unwrap().push("first"),
            )
            .unwrap();
        let order3 = order.clone();
        client
            .get(
                &[b"second"],
                false,
                move |k, v, _flags| {
                    order3.lock().unwrap().push("second");
                    assert_eq!((k, v), (b"second".to_vec(), b"second-value".to_vec()));
                },
                |_not_found| panic!("\"second\" is stored"),
            )
            .unwrap();

        client.run_local().await.unwrap();

        assert_eq!(order.lock().unwrap().as_slice(), &["first", "second"]);

        client.close();
        server_task.await.ok();
        completer.await.ok();
    }

    /// S5: a noreply write enqueues no response descriptor, so a get
    /// issued right after it is the only reply that comes back.
    #[tokio::test]
    async fn noreply_write_suppresses_its_reply_s5() {
        let (addr, server_task) = spawn_loopback_server(MapHandler::default()).await;

        let mut client = MemcachedClient::<TokioConnection>::new(ClientConfig::default());
        client.connect_ip(addr.to_string()).await.unwrap();

        client.set_noreply(b"k", b"v", 0, 0).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        client
            .get(
                &[b"k"],
                false,
                move |k, v, _flags| seen2.lock().unwrap().push((k, v)),
                |_not_found| {},
            )
            .unwrap();

        client.run_local().await.unwrap();

        assert_eq!(seen.lock().unwrap()[0], (b"k".to_vec(), b"v".to_vec()));

        client.close();
        server_task.await.ok();
    }

    struct ErroringIncrHandler;

    impl MemcachedHandler for ErroringIncrHandler {
        fn on_increment(
            &mut self,
            _key: &[u8],
            _delta: u64,
            _incr: bool,
            _noreply: bool,
            ctx: ReplyContext,
        ) -> ResponseResult<Option<u64>> {
            ctx.send_client_error("cannot increment");
            ResponseResult::Handled
        }
    }

    /// S6: a protocol-level error reply (CLIENT_ERROR/...) closes the
    /// client side of the pipeline and drops whatever was still queued
    /// behind it, over a real socket rather than `FakeConn`.
    #[tokio::test]
    async fn protocol_error_closes_the_connection_and_drops_queued_replies_s6() {
        let (addr, server_task) = spawn_loopback_server(ErroringIncrHandler).await;

        let mut client = MemcachedClient::<TokioConnection>::new(ClientConfig::default());
        client.connect_ip(addr.to_string()).await.unwrap();

        client.incr(b"counter", 1, |_| {}).unwrap();
        client.get(&[b"counter"], false, |_, _, _| {}, |_| {}).unwrap();

        let result = client.run_local().await;
        assert!(result.is_err());

        server_task.await.ok();
    }
}
