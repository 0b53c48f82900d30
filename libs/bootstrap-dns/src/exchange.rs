//! Plain-DNS wire exchange over the bypass dialer.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bypass_dialer::BypassDialer;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::{ResolveError, Upstream};

const MAX_RESPONSE_SIZE: usize = 4096;

/// Sends a single query for `record_type` and returns the answer addresses.
pub(crate) async fn query(
    dialer: &BypassDialer,
    upstream: &Upstream,
    server: SocketAddr,
    host: &str,
    record_type: RecordType,
    timeout: Duration,
) -> Result<Vec<IpAddr>, ResolveError> {
    let request = build_query(host, record_type)?;
    let request_id = request.id();
    let request_bytes = request
        .to_vec()
        .map_err(|e| ResolveError::Network(io::Error::other(e)))?;

    let exchange = async {
        if upstream.uses_tcp() {
            exchange_tcp(dialer, server, &request_bytes).await
        } else {
            exchange_udp(dialer, server, &request_bytes, request_id).await
        }
    };

    let response_bytes = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ResolveError::Network(io::Error::from(io::ErrorKind::TimedOut)))?
        .map_err(ResolveError::Network)?;

    let response = Message::from_vec(&response_bytes)
        .map_err(|e| ResolveError::Network(io::Error::other(e)))?;

    let rcode = u16::from(response.response_code());
    if rcode != 0 {
        return Err(ResolveError::Rcode(rcode));
    }

    let addresses = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) if record_type == RecordType::A => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) if record_type == RecordType::AAAA => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();

    Ok(addresses)
}

fn build_query(host: &str, record_type: RecordType) -> Result<Message, ResolveError> {
    let mut name = Name::from_utf8(host)
        .map_err(|e| ResolveError::InvalidUpstream(format!("bad hostname {host}: {e}")))?;
    name.set_fqdn(true);

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));

    Ok(message)
}

async fn exchange_udp(
    dialer: &BypassDialer,
    server: SocketAddr,
    request: &[u8],
    request_id: u16,
) -> io::Result<Vec<u8>> {
    let socket = dialer.udp(server).await?;
    socket.send(request).await?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    loop {
        let len = socket.recv(&mut buf).await?;
        // A connected socket only sees the upstream, but stray or stale
        // datagrams with a different transaction id are still possible.
        if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == request_id {
            buf.truncate(len);
            return Ok(buf);
        }
        tracing::trace!("Discarding DNS datagram with mismatched id");
    }
}

async fn exchange_tcp(
    dialer: &BypassDialer,
    server: SocketAddr,
    request: &[u8],
) -> io::Result<Vec<u8>> {
    let mut stream = dialer.tcp(server).await?;

    let len = u16::try_from(request.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "query too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(request).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u16::from_be_bytes(len_buf) as usize;

    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::Record;
    use hickory_proto::rr::rdata::A;

    /// Marking needs CAP_NET_ADMIN; unprivileged runs skip the wire tests.
    macro_rules! skip_if_unprivileged {
        ($result:expr) => {
            match $result {
                Err(ResolveError::Network(ref e))
                    if e.kind() == io::ErrorKind::PermissionDenied =>
                {
                    return;
                }
                other => other,
            }
        };
    }

    fn answer_for(request: &[u8], records: Vec<Record>) -> Vec<u8> {
        let request = Message::from_vec(request).unwrap();
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true);
        for query in request.queries() {
            response.add_query(query.clone());
        }
        for record in records {
            response.add_answer(record);
        }
        response.to_vec().unwrap()
    }

    fn a_record(name: &str, ip: std::net::Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_utf8(name).unwrap(), 60, RData::A(A(ip)))
    }

    #[tokio::test]
    async fn udp_round_trip() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let reply = answer_for(
                &buf[..len],
                vec![a_record("vpn.example.com.", std::net::Ipv4Addr::new(192, 0, 2, 33))],
            );
            server.send_to(&reply, from).await.unwrap();
        });

        let upstream = Upstream::parse(&format!("udp://{server_addr}")).unwrap();
        let dialer = BypassDialer::new();
        let addresses = skip_if_unprivileged!(
            query(
                &dialer,
                &upstream,
                server_addr,
                "vpn.example.com",
                RecordType::A,
                Duration::from_secs(2),
            )
            .await
        )
        .unwrap();

        assert_eq!(
            addresses,
            vec![IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 33))]
        );
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut request = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut request).await.unwrap();

            let reply = answer_for(
                &request,
                vec![a_record("vpn.example.com.", std::net::Ipv4Addr::new(192, 0, 2, 34))],
            );
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let upstream = Upstream::parse(&format!("tcp://{server_addr}")).unwrap();
        let dialer = BypassDialer::new();
        let addresses = skip_if_unprivileged!(
            query(
                &dialer,
                &upstream,
                server_addr,
                "vpn.example.com",
                RecordType::A,
                Duration::from_secs(2),
            )
            .await
        )
        .unwrap();

        assert_eq!(
            addresses,
            vec![IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 34))]
        );
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_rcode_is_reported() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_response_code(hickory_proto::op::ResponseCode::NXDomain);
            server
                .send_to(&response.to_vec().unwrap(), from)
                .await
                .unwrap();
        });

        let upstream = Upstream::parse(&format!("udp://{server_addr}")).unwrap();
        let dialer = BypassDialer::new();
        let err = skip_if_unprivileged!(
            query(
                &dialer,
                &upstream,
                server_addr,
                "missing.example.com",
                RecordType::A,
                Duration::from_secs(2),
            )
            .await
        )
        .unwrap_err();

        assert!(matches!(err, ResolveError::Rcode(3)));
        responder.await.unwrap();
    }
}
