//! Bedrock-edition status query (RakNet unconnected ping).
//!
//! Request: `0x01 | i64 time | magic[16] | u64 client guid`.
//! Reply:   `0x1c | i64 time | u64 server guid | magic[16] | u16 len | advertisement`.
//! The advertisement is `;`-separated: `MCPE;motd;protocol;version;players;max;...`.

use std::{collections::BTreeMap, future::Future, net::SocketAddr, time::Duration};

use hive_process::ServerInfo;
use tokio::net::UdpSocket;

use crate::error::Unreachable;

pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];
const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PONG: u8 = 0x1c;
const PING_LEN: usize = 1 + 8 + 16 + 8;
// id + time + guid + magic + string length
const PONG_HEADER_LEN: usize = 1 + 8 + 8 + 16 + 2;

const ADVERTISEMENT_KEYS: [&str; 12] = [
    "gamename",
    "hostname",
    "protocol",
    "version",
    "players",
    "maxplayers",
    "serverid",
    "map",
    "gamemode",
    "nintendolimited",
    "ipv4port",
    "ipv6port",
];

pub fn encode_ping(time_ms: u64, client_guid: u64) -> [u8; PING_LEN] {
    let mut buf = [0u8; PING_LEN];
    buf[0] = UNCONNECTED_PING;
    buf[1..9].copy_from_slice(&time_ms.to_be_bytes());
    buf[9..25].copy_from_slice(&OFFLINE_MAGIC);
    buf[25..33].copy_from_slice(&client_guid.to_be_bytes());
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub time_ms: u64,
    pub server_guid: u64,
    pub advertisement: String,
}

pub fn encode_pong(pong: &Pong) -> Vec<u8> {
    let adv = pong.advertisement.as_bytes();
    let mut buf = Vec::with_capacity(PONG_HEADER_LEN + adv.len());
    buf.push(UNCONNECTED_PONG);
    buf.extend_from_slice(&pong.time_ms.to_be_bytes());
    buf.extend_from_slice(&pong.server_guid.to_be_bytes());
    buf.extend_from_slice(&OFFLINE_MAGIC);
    buf.extend_from_slice(&(adv.len() as u16).to_be_bytes());
    buf.extend_from_slice(adv);
    buf
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub fn decode_pong(buf: &[u8]) -> Result<Pong, String> {
    if buf.len() < PONG_HEADER_LEN {
        return Err(format!("short reply ({} bytes)", buf.len()));
    }
    if buf[0] != UNCONNECTED_PONG {
        return Err(format!("unexpected packet id 0x{:02x}", buf[0]));
    }
    let time_ms = read_u64(buf, 1).ok_or("truncated time")?;
    let server_guid = read_u64(buf, 9).ok_or("truncated guid")?;
    if buf[17..33] != OFFLINE_MAGIC {
        return Err("bad offline magic".to_string());
    }
    let len = u16::from_be_bytes([buf[33], buf[34]]) as usize;
    let body = buf
        .get(35..35 + len)
        .ok_or_else(|| format!("advertisement truncated (want {len} bytes)"))?;
    Ok(Pong {
        time_ms,
        server_guid,
        advertisement: String::from_utf8_lossy(body).into_owned(),
    })
}

pub fn parse_advertisement(adv: &str) -> Result<ServerInfo, String> {
    let parts: Vec<&str> = adv.split(';').collect();
    if parts.len() < 6 || parts[0].trim().is_empty() {
        return Err(format!("malformed advertisement: {adv:?}"));
    }
    let mut fields = BTreeMap::new();
    for (i, v) in parts.iter().enumerate() {
        let key = match ADVERTISEMENT_KEYS.get(i) {
            Some(k) => (*k).to_string(),
            None if v.is_empty() => continue,
            None => format!("extra{}", i - ADVERTISEMENT_KEYS.len()),
        };
        fields.insert(key, (*v).to_string());
    }
    Ok(ServerInfo::from_fields(fields))
}

pub trait HealthProber: Send + Sync + 'static {
    fn probe(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<ServerInfo, Unreachable>> + Send;
}

#[derive(Debug, Clone)]
pub struct RakNetProber {
    timeout: Duration,
    client_guid: u64,
}

impl RakNetProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client_guid: rand::random(),
        }
    }

    async fn exchange(&self, host: &str, port: u16) -> Result<ServerInfo, String> {
        let target: SocketAddr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| format!("resolve: {e}"))?
            .next()
            .ok_or_else(|| "no address".to_string())?;
        let bind: SocketAddr = if target.is_ipv6() {
            "[::]:0".parse().map_err(|e| format!("{e}"))?
        } else {
            ([0, 0, 0, 0], 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| format!("bind: {e}"))?;

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        socket
            .send_to(&encode_ping(now_ms, self.client_guid), target)
            .await
            .map_err(|e| format!("send: {e}"))?;

        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| format!("recv: {e}"))?;
            // Ignore stray datagrams from other peers.
            if from.port() != target.port() {
                continue;
            }
            let pong = decode_pong(&buf[..n])?;
            return parse_advertisement(&pong.advertisement);
        }
    }
}

impl HealthProber for RakNetProber {
    async fn probe(&self, host: &str, port: u16) -> Result<ServerInfo, Unreachable> {
        let unreachable = |reason: String| Unreachable {
            host: host.to_string(),
            port,
            reason,
        };
        match tokio::time::timeout(self.timeout, self.exchange(host, port)).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(reason)) => Err(unreachable(reason)),
            Err(_) => Err(unreachable(format!(
                "no reply within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADV: &str = "MCPE;Lobby;589;1.20.0;3;20;1234567890;Hive world;Survival;1;19132;19133;";

    #[test]
    fn pong_decodes_and_rejects_garbage() {
        let pong = Pong {
            time_ms: 7,
            server_guid: 99,
            advertisement: ADV.to_string(),
        };
        let bytes = encode_pong(&pong);
        assert_eq!(decode_pong(&bytes).unwrap(), pong);

        assert!(decode_pong(&bytes[..10]).is_err());
        let mut bad = bytes.clone();
        bad[0] = 0x1d;
        assert!(decode_pong(&bad).is_err());
        let mut bad = bytes.clone();
        bad[20] ^= 0xff;
        assert!(decode_pong(&bad).unwrap_err().contains("magic"));
        assert!(decode_pong(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn advertisement_fields_are_named_and_lower_case() {
        let info = parse_advertisement(ADV).unwrap();
        assert_eq!(info.players, Some(3));
        assert_eq!(info.max_players, Some(20));
        assert_eq!(info.fields["hostname"], "Lobby");
        assert_eq!(info.fields["gamemode"], "Survival");
        assert_eq!(info.fields["ipv6port"], "19133");
        assert!(info.fields.keys().all(|k| k == &k.to_ascii_lowercase()));

        assert!(parse_advertisement("MCPE;only;three").is_err());
    }

    #[test]
    fn ping_layout() {
        let ping = encode_ping(1, 2);
        assert_eq!(ping[0], 0x01);
        assert_eq!(&ping[9..25], &OFFLINE_MAGIC);
        assert_eq!(ping[32], 2);
    }

    #[tokio::test]
    async fn probe_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, PING_LEN);
            let time_ms = read_u64(&buf, 1).unwrap();
            let reply = encode_pong(&Pong {
                time_ms,
                server_guid: 1,
                advertisement: ADV.to_string(),
            });
            server.send_to(&reply, from).await.unwrap();
        });

        let prober = RakNetProber::new(Duration::from_secs(2));
        let info = prober.probe("127.0.0.1", port).await.unwrap();
        assert_eq!(info.players, Some(3));
    }

    #[tokio::test]
    async fn silent_server_is_unreachable_within_timeout() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let prober = RakNetProber::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = prober.probe("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.port, port);
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(silent);
    }
}
