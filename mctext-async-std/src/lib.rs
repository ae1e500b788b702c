//! async-std [`Connection`] implementation for `mctext-core`.

use async_std::io::{ReadExt, WriteExt};
use async_std::net::TcpStream;
use async_trait::async_trait;
use bytes::BytesMut;
use mctext_core::{Connection, Error};
use std::time::Duration;

#[derive(Debug)]
pub struct AsyncStdConnection {
    stream: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl AsyncStdConnection {
    pub fn from_stream(stream: TcpStream) -> Self {
        AsyncStdConnection {
            stream,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[async_trait]
impl Connection for AsyncStdConnection {
    async fn connect(addr: String) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await.map_err(Error::Connect)?;
        Ok(AsyncStdConnection {
            stream,
            read_timeout: None,
            write_timeout: None,
        })
    }

    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        let mut chunk = [0u8; 4096];
        let fut = self.stream.read(&mut chunk);
        let n = match self.read_timeout {
            Some(d) => async_std::future::timeout(d, fut).await.map_err(|_| Error::Timeout)??,
            None => fut.await?,
        };
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let fut = self.stream.write_all(data);
        match self.write_timeout {
            Some(d) => async_std::future::timeout(d, fut)
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
    use async_std::net::TcpListener;
    use mctext_core::client::MemcachedClient;
    use mctext_core::config::ClientConfig;
    use mctext_core::server::{
        GetValue, MemcachedHandler, MemcachedServerConn, ReplyContext, ResponseResult,
        StoreRequest,
    };
    use mctext_core::{ServerConfig, StoreResult};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

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

    /// S1: pipelined set/get over a real TCP loopback socket, driven
    /// entirely on the async-std runtime.
    #[test]
    fn client_and_server_round_trip_over_tcp_loopback_s1() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server_task = async_std::task::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let conn = AsyncStdConnection::from_stream(stream);
                let mut server = MemcachedServerConn::new(conn, MapHandler::default(), ServerConfig::default());
                server.serve().await.ok();
            });

            let mut client = MemcachedClient::<AsyncStdConnection>::new(ClientConfig::default());
            client.connect_ip(addr.to_string()).await.unwrap();

            client.set(b"greeting", b"hello", 0, 0, |_| {}).unwrap();

            let seen = Arc::new(StdMutex::new(Vec::new()));
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
            server_task.cancel().await;
        });
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

    /// S6: a protocol error reply closes the client pipeline and drops
    /// whatever else was queued behind it.
    #[test]
    fn protocol_error_closes_the_connection_and_drops_queued_replies_s6() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server_task = async_std::task::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let conn = AsyncStdConnection::from_stream(stream);
                let mut server = MemcachedServerConn::new(conn, ErroringIncrHandler, ServerConfig::default());
                server.serve().await.ok();
            });

            let mut client = MemcachedClient::<AsyncStdConnection>::new(ClientConfig::default());
            client.connect_ip(addr.to_string()).await.unwrap();

            client.incr(b"counter", 1, |_| {}).unwrap();
            client.get(&[b"counter"], false, |_, _, _| {}, |_| {}).unwrap();

            let result = client.run_local().await;
            assert!(result.is_err());

            server_task.cancel().await;
        });
    }

    #[test]
    fn connect_fails_fast_against_a_closed_port() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let mut client = MemcachedClient::<AsyncStdConnection>::new(ClientConfig::default());
            let result = client.connect_ip(addr.to_string()).await;
            assert!(result.is_err());
        });
    }

    #[test]
    fn read_times_out_when_the_peer_never_writes() {
        tokio_test::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let accept_task = async_std::task::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                // Hold the connection open without ever writing to it.
                async_std::task::sleep(Duration::from_secs(5)).await;
                drop(stream);
            });

            let mut conn = AsyncStdConnection::connect(addr.to_string()).await.unwrap();
            conn.set_read_timeout(Some(Duration::from_millis(50)));

            let mut buf = BytesMut::new();
            let result = conn.read(&mut buf).await;
            assert!(matches!(result, Err(Error::Timeout)));

            accept_task.cancel().await;
        });
    }
}
