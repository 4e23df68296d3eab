// Copyright 2025 jonefeewang@gmail.com
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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hearth::{setup_local_tracing, Agent, Connection, FrameCodec, NetworkConfig, TcpServer};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

struct Echo {
    conn: Connection,
    closed: Arc<AtomicUsize>,
}

impl Agent for Echo {
    async fn run(&mut self) {
        while let Ok(msg) = self.conn.read_msg().await {
            if self.conn.write_msg(&[&msg[..]]).is_err() {
                break;
            }
        }
    }

    fn on_close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writes until the peer stops reading and the write queue backs up.
struct Flood {
    conn: Connection,
    stalled: Arc<AtomicBool>,
    keep_reading: bool,
    closed: Arc<AtomicUsize>,
}

impl Agent for Flood {
    async fn run(&mut self) {
        let chunk = Bytes::from(vec![7u8; 64 * 1024]);
        while matches!(
            timeout(Duration::from_millis(200), self.conn.send(chunk.clone())).await,
            Ok(Ok(()))
        ) {}
        self.stalled.store(true, Ordering::SeqCst);
        if self.keep_reading {
            while self.conn.read_msg().await.is_ok() {}
        }
    }

    fn on_close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn flood_server(keep_reading: bool) -> (TcpServer<Flood>, Arc<AtomicBool>, Arc<AtomicUsize>) {
    let stalled = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::new(local_config(10));
    let (flag, counter) = (stalled.clone(), closed.clone());
    server.set_new_agent(move |conn| Flood {
        conn,
        stalled: flag.clone(),
        keep_reading,
        closed: counter.clone(),
    });
    (server, stalled, closed)
}

fn local_config(max_conn_num: usize) -> NetworkConfig {
    NetworkConfig {
        addr: "127.0.0.1:0".to_string(),
        max_conn_num,
        ..Default::default()
    }
}

fn echo_server(config: NetworkConfig) -> (TcpServer<Echo>, Arc<AtomicUsize>) {
    let closed = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::new(config);
    let counter = closed.clone();
    server.set_new_agent(move |conn| Echo {
        conn,
        closed: counter.clone(),
    });
    (server, closed)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Reads until the server closes the socket; returns what was received.
async fn read_until_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("server kept the connection open")
        .unwrap();
    received
}

#[tokio::test]
async fn echoes_frames_with_configured_framing() {
    setup_local_tracing().unwrap();
    let config = NetworkConfig {
        len_msg_len: 4,
        little_endian: true,
        ..local_config(10)
    };
    let codec = FrameCodec::from_config(&config);
    let (mut server, closed) = echo_server(config);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    codec.write(&mut stream, &[&b"ping"[..]]).await.unwrap();
    codec
        .write(&mut stream, &[&b"po"[..], &b"ng"[..]])
        .await
        .unwrap();

    let mut framed = Framed::new(stream, codec);
    assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"ping");
    assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"pong");
    assert_eq!(server.conn_count(), 1);

    drop(framed);
    wait_until(|| closed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.conn_count(), 0);
    server.close().await;
}

#[tokio::test]
async fn connections_over_the_limit_are_closed() {
    let (mut server, closed) = echo_server(local_config(2));
    let addr = server.start().await.unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.conn_count() == 2).await;

    let mut third = TcpStream::connect(addr).await.unwrap();
    assert!(read_until_eof(&mut third).await.is_empty());
    assert_eq!(server.conn_count(), 2);
    // a rejected socket never gets an agent
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    server.close().await;
}

#[tokio::test]
async fn close_stops_accepting_and_closes_every_connection() {
    let (mut server, closed) = echo_server(local_config(10));
    let addr = server.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_until(|| server.conn_count() == 3).await;

    server.close().await;
    // close returns only after every agent finished
    assert_eq!(closed.load(Ordering::SeqCst), 3);
    assert_eq!(server.conn_count(), 0);
    for client in &mut clients {
        assert!(read_until_eof(client).await.is_empty());
    }
    assert!(TcpStream::connect(addr).await.is_err());

    server.close().await;
}

#[tokio::test]
async fn close_stops_writers_of_connections_whose_agent_returned() {
    let (mut server, stalled, closed) = flood_server(false);
    let addr = server.start().await.unwrap();

    // never reads, so the closed connection's writer stays stuck flushing
    let _client = TcpStream::connect(addr).await.unwrap();
    wait_until(|| stalled.load(Ordering::SeqCst) && closed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.conn_count(), 0);

    timeout(Duration::from_secs(2), server.close())
        .await
        .expect("close waited on a flushing writer");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_does_not_wait_for_a_stalled_flush() {
    let (mut server, stalled, closed) = flood_server(true);
    let addr = server.start().await.unwrap();

    let _client = TcpStream::connect(addr).await.unwrap();
    wait_until(|| stalled.load(Ordering::SeqCst)).await;
    assert_eq!(server.conn_count(), 1);

    timeout(Duration::from_secs(2), server.close())
        .await
        .expect("close waited on a flushing writer");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(server.conn_count(), 0);
}
