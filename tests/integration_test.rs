//! Integration tests against a scripted broker listening on a local port.

use bytes::BytesMut;
use mqtt_delivery::{
    client::{
        AckMode,
        Client,
        ClientBuilder,
        DisconnectSource,
        Publish,
        QoS,
        Subscribe,
        SubscribeTopic,
    },
    codec,
    packet::{self, Ack, Connack, Message, Packet, Pid, ReasonCode, Suback},
    Error,
    Result,
};
use std::{
    convert::TryFrom,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{
        Duration,
        timeout,
    },
};

/// One accepted connection, as seen from the broker side.
struct Peer {
    stream: TcpStream,
    buf: BytesMut,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Result<Peer> {
        let (stream, _) = listener.accept().await?;
        Ok(Peer { stream, buf: BytesMut::new() })
    }

    async fn recv(&mut self) -> Result<Packet> {
        loop {
            if !self.buf.is_empty() {
                if let Some(p) = codec::decode(&mut self.buf)? {
                    return Ok(p);
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ConnectionLost("client closed".to_owned()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send(&mut self, p: Packet) -> Result<()> {
        let mut bytes = BytesMut::with_capacity(64 * 1024);
        codec::encode(&p, &mut bytes)?;
        self.stream.write_all(&*bytes).await?;
        Ok(())
    }

    /// Read CONNECT and answer with `connack`. Returns the CONNECT's
    /// clean session flag.
    async fn handshake(&mut self, session_present: bool, reason: ReasonCode) -> Result<bool> {
        let clean = match self.recv().await? {
            Packet::Connect(c) => c.clean_session,
            p => panic!("expected CONNECT, got {:?}", p),
        };
        self.send(Packet::Connack(Connack {
            session_present,
            reason,
            receive_maximum: None,
        })).await?;
        Ok(clean)
    }

    async fn expect_disconnect(&mut self) -> Result<()> {
        match self.recv().await? {
            Packet::Disconnect(_) => Ok(()),
            p => panic!("expected DISCONNECT, got {:?}", p),
        }
    }
}

async fn listen() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn builder(port: u16) -> ClientBuilder {
    let mut b = Client::builder();
    b.set_host("127.0.0.1".to_owned())
     .set_port(port)
     .set_operation_timeout(Duration::from_secs(5))
     .set_connect_retry_delay(Duration::from_millis(50));
    b
}

fn run<F: std::future::Future<Output = Result<()>>>(f: F) -> Result<()> {
    let _ = env_logger::try_init();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match timeout(Duration::from_secs(20), f).await {
            Ok(r) => r,
            Err(_) => Err("test timed out".into()),
        }
    })
}

async fn join(broker: JoinHandle<Result<()>>) -> Result<()> {
    broker.await.map_err(Error::from_std_err)?
}

fn pid(x: u16) -> Pid {
    Pid::try_from(x).expect("non-zero pid")
}

fn incoming(p: u16, qos: QoS, dup: bool, topic: &str, payload: &[u8]) -> Packet {
    Packet::Publish(packet::Publish {
        dup,
        pid: Some(pid(p)),
        message: Message {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            retain: false,
        },
    })
}

#[test]
fn qos1_publish() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            assert!(peer.handshake(false, ReasonCode::SUCCESS).await?);
            let p = match peer.recv().await? {
                Packet::Publish(p) => p,
                p => panic!("expected PUBLISH, got {:?}", p),
            };
            assert_eq!(p.qos(), QoS::AtLeastOnce);
            assert_eq!(p.message.topic, "a/b");
            assert_eq!(p.message.payload, b"x");
            assert!(!p.dup);
            let p_pid = p.pid.expect("QoS 1 has a pid");
            peer.send(Packet::Puback(Ack::success(p_pid))).await?;
            peer.expect_disconnect().await
        });

        let mut c = builder(port).build()?;
        c.connect().await?;
        let mut p = Publish::new("a/b".to_owned(), b"x".to_vec());
        p.set_qos(QoS::AtLeastOnce);
        let r = c.publish(&p).await?;
        assert_eq!(r.qos, QoS::AtLeastOnce);
        assert!(r.pid.is_some());
        assert_eq!(r.reason, ReasonCode::SUCCESS);
        c.disconnect().await?;
        join(broker).await
    })
}

#[test]
fn qos2_publish() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            peer.handshake(false, ReasonCode::SUCCESS).await?;
            let p_pid = match peer.recv().await? {
                Packet::Publish(p) => {
                    assert_eq!(p.qos(), QoS::ExactlyOnce);
                    p.pid.expect("QoS 2 has a pid")
                }
                p => panic!("expected PUBLISH, got {:?}", p),
            };
            peer.send(Packet::Pubrec(Ack::success(p_pid))).await?;
            assert_eq!(peer.recv().await?, Packet::Pubrel(Ack::success(p_pid)));
            peer.send(Packet::Pubcomp(Ack::success(p_pid))).await?;
            peer.expect_disconnect().await
        });

        let mut c = builder(port).build()?;
        c.connect().await?;
        let mut p = Publish::new("q2".to_owned(), b"y".to_vec());
        p.set_qos(QoS::ExactlyOnce);
        let r = c.publish(&p).await?;
        assert_eq!(r.qos, QoS::ExactlyOnce);
        c.disconnect().await?;
        join(broker).await
    })
}

#[test]
fn manual_ack_holds_puback() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let (acked_tx, mut acked_rx) = oneshot::channel::<()>();
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            peer.handshake(false, ReasonCode::SUCCESS).await?;
            let s = match peer.recv().await? {
                Packet::Subscribe(s) => s,
                p => panic!("expected SUBSCRIBE, got {:?}", p),
            };
            assert!(s.pid.get() > 65525);
            assert_eq!(s.topics[0].filter, "a/+");
            peer.send(Packet::Suback(Suback {
                pid: s.pid,
                granted: vec![Some(QoS::AtLeastOnce)],
            })).await?;
            peer.send(incoming(7, QoS::AtLeastOnce, false, "a/b", b"m")).await?;

            assert_eq!(peer.recv().await?, Packet::Puback(Ack::success(pid(7))));
            assert!(acked_rx.try_recv().is_ok(), "PUBACK sent before the application acked");

            let u = match peer.recv().await? {
                Packet::Unsubscribe(u) => u,
                p => panic!("expected UNSUBSCRIBE, got {:?}", p),
            };
            assert_eq!(u.filters, vec!["a/+".to_owned()]);
            peer.send(Packet::Unsuback(u.pid)).await?;
            peer.expect_disconnect().await
        });

        let mut c = builder(port).build()?;
        c.connect().await?;
        let mut sub = c.subscribe(
            Subscribe::new(vec![SubscribeTopic { filter: "a/+".to_owned(),
                                                 qos: QoS::AtLeastOnce }]),
            AckMode::Manual).await?;
        sub.any_failures()?;
        assert_eq!(sub.granted(), &[Some(QoS::AtLeastOnce)]);

        let mut d = sub.recv().await.ok_or(Error::Disconnected)?;
        assert_eq!(d.topic(), "a/b");
        assert_eq!(d.payload(), b"m");
        assert!(d.needs_ack());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = acked_tx.send(());
        d.acknowledge();

        sub.unsubscribe().await?;
        c.disconnect().await?;
        join(broker).await
    })
}

#[test]
fn incoming_qos2_handshake() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            peer.handshake(false, ReasonCode::SUCCESS).await?;
            let s = match peer.recv().await? {
                Packet::Subscribe(s) => s,
                p => panic!("expected SUBSCRIBE, got {:?}", p),
            };
            peer.send(Packet::Suback(Suback {
                pid: s.pid,
                granted: vec![Some(QoS::ExactlyOnce)],
            })).await?;
            peer.send(incoming(3, QoS::ExactlyOnce, false, "t", b"1")).await?;
            assert_eq!(peer.recv().await?, Packet::Pubrec(Ack::success(pid(3))));
            // A retransmission before PUBREL is answered but not delivered again.
            peer.send(incoming(3, QoS::ExactlyOnce, true, "t", b"1")).await?;
            assert_eq!(peer.recv().await?, Packet::Pubrec(Ack::success(pid(3))));
            peer.send(Packet::Pubrel(Ack::success(pid(3)))).await?;
            assert_eq!(peer.recv().await?, Packet::Pubcomp(Ack::success(pid(3))));
            peer.send(incoming(4, QoS::ExactlyOnce, false, "t", b"2")).await?;
            assert_eq!(peer.recv().await?, Packet::Pubrec(Ack::success(pid(4))));
            peer.send(Packet::Pubrel(Ack::success(pid(4)))).await?;
            assert_eq!(peer.recv().await?, Packet::Pubcomp(Ack::success(pid(4))));
            let _ = done_tx.send(());
            peer.expect_disconnect().await
        });

        let mut c = builder(port).build()?;
        c.connect().await?;
        let mut sub = c.subscribe(
            Subscribe::new(vec![SubscribeTopic { filter: "#".to_owned(),
                                                 qos: QoS::ExactlyOnce }]),
            AckMode::Automatic).await?;
        let d1 = sub.recv().await.ok_or(Error::Disconnected)?;
        assert_eq!(d1.payload(), b"1");
        let d2 = sub.recv().await.ok_or(Error::Disconnected)?;
        assert_eq!(d2.payload(), b"2");
        // PUBREL(4) may still be on its way; finish the handshake first.
        done_rx.await.map_err(Error::from_std_err)?;
        c.disconnect().await?;
        join(broker).await
    })
}

#[test]
fn reconnect_resends_open_publish() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            assert!(!peer.handshake(false, ReasonCode::SUCCESS).await?);
            let first = match peer.recv().await? {
                Packet::Publish(p) => p,
                p => panic!("expected PUBLISH, got {:?}", p),
            };
            assert!(!first.dup);
            drop(peer);

            let mut peer = Peer::accept(&listener).await?;
            assert!(!peer.handshake(true, ReasonCode::SUCCESS).await?);
            let again = match peer.recv().await? {
                Packet::Publish(p) => p,
                p => panic!("expected PUBLISH, got {:?}", p),
            };
            assert!(again.dup);
            assert_eq!(again.pid, first.pid);
            assert_eq!(again.message, first.message);
            let p_pid = again.pid.expect("QoS 1 has a pid");
            peer.send(Packet::Puback(Ack::success(p_pid))).await?;
            peer.expect_disconnect().await
        });

        let connects = Arc::new(AtomicUsize::new(0));
        let sources = Arc::new(Mutex::new(Vec::new()));
        let mut b = builder(port);
        b.set_client_id(Some("resume".to_owned()))
         .set_clean_session(false);
        let counter = connects.clone();
        b.add_connected_listener(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let seen = sources.clone();
        b.add_disconnected_listener(move |ctx| {
            seen.lock().expect("lock").push(ctx.source());
        });

        let mut c = b.build()?;
        c.connect().await?;
        let mut p = Publish::new("r".to_owned(), b"z".to_vec());
        p.set_qos(QoS::AtLeastOnce);
        let r = c.publish(&p).await?;
        assert_eq!(r.reason, ReasonCode::SUCCESS);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        c.disconnect().await?;
        join(broker).await?;
        assert_eq!(*sources.lock().expect("lock"),
                   vec![DisconnectSource::Server, DisconnectSource::User]);
        Ok(())
    })
}

#[test]
fn lost_session_fails_open_publish() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            peer.handshake(false, ReasonCode::SUCCESS).await?;
            match peer.recv().await? {
                Packet::Publish(_) => (),
                p => panic!("expected PUBLISH, got {:?}", p),
            }
            drop(peer);

            let mut peer = Peer::accept(&listener).await?;
            peer.handshake(false, ReasonCode::SUCCESS).await?;
            peer.expect_disconnect().await
        });

        let mut c = builder(port).build()?;
        c.connect().await?;
        let mut p = Publish::new("gone".to_owned(), b"z".to_vec());
        p.set_qos(QoS::ExactlyOnce);
        match c.publish(&p).await {
            Err(Error::SessionExpired) => (),
            r => panic!("expected SessionExpired, got {:?}", r),
        }
        c.disconnect().await?;
        join(broker).await
    })
}

#[test]
fn refused_connect() -> Result<()> {
    run(async {
        let (listener, port) = listen().await?;
        let broker = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await?;
            peer.handshake(false, ReasonCode(0x87)).await?;
            Ok(())
        });

        let mut b = builder(port);
        b.set_automatic_connect(false);
        let mut c = b.build()?;
        match c.connect().await {
            Err(Error::RemoteError { packet: "CONNACK", reason }) =>
                assert_eq!(reason, ReasonCode(0x87)),
            r => panic!("expected a refused CONNACK, got {:?}", r),
        }
        join(broker).await?;

        // No connection task is left behind.
        assert!(matches!(c.disconnect().await, Err(Error::Disconnected)));
        Ok(())
    })
}
