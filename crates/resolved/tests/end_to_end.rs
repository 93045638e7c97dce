use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use dns_resolver::cache::SharedCache;
use dns_resolver::recursive::Resolver;
use dns_resolver::upstream::test_util::*;
use dns_types::protocol::types::test_util::*;
use dns_types::protocol::types::*;

use resolved::server::Server;
use resolved::settings::Settings;

const ROOT: Ipv4Addr = Ipv4Addr::new(198, 41, 0, 4);

async fn ask(client: &UdpSocket, server: SocketAddr, id: u16) -> Message {
    let mut request = Message::from_question(
        id,
        Question {
            name: domain("example.test"),
            qtype: RecordType::A,
            qclass: RecordClass::IN,
        },
    );
    request.header.flags |= HEADER_MASK_RD;

    client
        .send_to(&request.to_octets().unwrap(), server)
        .await
        .unwrap();

    let mut buf = vec![0u8; 512];
    let (size, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    Message::from_octets(&buf[..size]).unwrap()
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let upstream = ScriptedUpstream::new();
    let answer = a_record("example.test", Ipv4Addr::new(93, 184, 216, 34));
    upstream.reply(
        ROOT,
        "example.test",
        RecordType::A,
        ScriptedReply {
            answers: vec![answer.clone()],
            ..Default::default()
        },
    );

    let settings = Settings {
        server_port: 0,
        ..Settings::default()
    };
    let cache = SharedCache::new();
    let server = Server::bind(
        &settings,
        Resolver::new(upstream.clone(), settings.root_server_ip, settings.root_server_port),
        cache.clone(),
    )
    .await
    .unwrap();
    let address = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let first = ask(&client, address, 100).await;
    assert_eq!(100, first.header.id);
    assert!(first.header.is_response());
    assert_eq!(Rcode::NoError, first.header.rcode());
    assert_eq!(vec![answer.clone()], first.answers);
    assert_eq!("93.184.216.34", first.answers[0].rtype_with_data.to_string());
    assert_eq!(300, first.answers[0].ttl);
    assert_eq!(1, upstream.queries().len());

    let second = ask(&client, address, 101).await;
    assert_eq!(101, second.header.id);
    assert_eq!(vec![answer], second.answers);
    assert_eq!(1, upstream.queries().len());
    assert_eq!(1, cache.len());

    stop.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn unresolvable_request_gets_unsupported_response() {
    let upstream = ScriptedUpstream::new();

    let settings = Settings {
        server_port: 0,
        ..Settings::default()
    };
    let server = Server::bind(
        &settings,
        Resolver::new(upstream.clone(), settings.root_server_ip, settings.root_server_port),
        SharedCache::new(),
    )
    .await
    .unwrap();
    let address = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let response = ask(&client, address, 7).await;

    assert_eq!(Message::make_unsupported_response(7), response);

    stop.send(()).unwrap();
    handle.await.unwrap();
}
