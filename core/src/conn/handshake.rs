//! Session handshake
//!
//! Two paths establish an authenticated session, both line-oriented and
//! completed before any data line is honored:
//!
//! - **Pairing** (`HELLO` / `HELLO_ACK`): each side sends an ephemeral
//!   X25519 key signed by its Ed25519 identity key; both derive the shared
//!   secret via ECDH. Trust in the identity key is on first use.
//! - **Re-authentication** (`AUTH` / `AUTH_OK`): a peer we already share a
//!   secret with proves possession by sealing a timestamped proof under it.
//!   The proof body also refreshes the peer's name, port and device class.

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use uuid::Uuid;

use crate::conn::session::{read_wire_line, write_line};
use crate::crypto::{EphemeralSecret, ExchangeKey, SharedSecret, VerifyingKey};
use crate::protocol::constants::AUTH_TIME_SKEW;
use crate::protocol::wire::{encode_auth, parse_line, DeviceType, HelloFrame, Line};
use crate::protocol::{now_millis, AuthProof};
use crate::trust::{AuthInfo, TrustStore};
use crate::{DeviceIdentity, Error, Result};

/// Outcome of a completed handshake, either direction.
#[derive(Debug)]
pub struct HandshakeResult {
    pub peer_uuid: Uuid,
    pub display_name: String,
    pub device_type: DeviceType,
    pub tcp_port: u16,
    pub secret: SharedSecret,
    /// True when this exchange was a first-time pairing (or re-pairing),
    /// false for re-authentication under an existing secret.
    pub newly_paired: bool,
}

fn transcript(uuid: &Uuid, exchange_key: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(48);
    data.extend_from_slice(uuid.as_bytes());
    data.extend_from_slice(exchange_key);
    data
}

fn verify_hello(frame: &HelloFrame) -> Result<()> {
    let identity = VerifyingKey::from_bytes(&frame.identity_key)?;
    identity
        .verify(&transcript(&frame.uuid, &frame.exchange_key), &frame.signature)
        .map_err(|_| Error::Handshake("hello signature invalid".to_string()))
}

fn local_hello(identity: &DeviceIdentity, tcp_port: u16, eph: &EphemeralSecret) -> HelloFrame {
    let exchange_key = eph.public_key().to_bytes();
    let signature = identity.signing_key.sign(&transcript(&identity.uuid, &exchange_key));
    HelloFrame {
        uuid: identity.uuid,
        display_name: identity.name.clone(),
        tcp_port,
        device_type: identity.device_type.clone(),
        exchange_key,
        identity_key: identity.signing_key.verifying_key().to_bytes(),
        signature,
    }
}

fn local_proof(identity: &DeviceIdentity, tcp_port: u16, secret: &SharedSecret) -> Result<Vec<u8>> {
    let proof = AuthProof {
        time: now_millis(),
        display_name: identity.name.clone(),
        device_type: identity.device_type.clone(),
        tcp_port,
    };
    secret.seal(&serde_json::to_vec(&proof)?)
}

fn open_proof(secret: &SharedSecret, sealed: &[u8]) -> Result<AuthProof> {
    let plain = secret
        .open(sealed)
        .map_err(|_| Error::Handshake("auth proof does not open".to_string()))?;
    let proof: AuthProof = serde_json::from_slice(&plain)?;
    let skew = now_millis().abs_diff(proof.time);
    if skew > AUTH_TIME_SKEW.as_millis() as u64 {
        return Err(Error::Handshake(format!("auth proof stale by {skew}ms")));
    }
    Ok(proof)
}

async fn expect_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<Line> {
    let line = read_wire_line(reader)
        .await?
        .ok_or_else(|| Error::Handshake("connection closed mid-handshake".to_string()))?;
    parse_line(&line)
}

/// Outbound handshake. With a known trust record this is the cheap AUTH
/// exchange; otherwise a full pairing.
pub async fn initiate(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    identity: &DeviceIdentity,
    tcp_port: u16,
    known: Option<&AuthInfo>,
) -> Result<HandshakeResult> {
    match known {
        Some(auth) => initiate_auth(reader, writer, identity, tcp_port, auth).await,
        None => initiate_pairing(reader, writer, identity, tcp_port).await,
    }
}

async fn initiate_auth(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    identity: &DeviceIdentity,
    tcp_port: u16,
    auth: &AuthInfo,
) -> Result<HandshakeResult> {
    let sealed = local_proof(identity, tcp_port, &auth.shared_secret)?;
    write_line(writer, &encode_auth(identity.uuid, &sealed, false)).await?;

    match expect_line(reader).await? {
        Line::AuthOk { uuid, proof } if uuid == auth.uuid => {
            let proof = open_proof(&auth.shared_secret, &proof)?;
            Ok(HandshakeResult {
                peer_uuid: uuid,
                display_name: proof.display_name,
                device_type: proof.device_type,
                tcp_port: proof.tcp_port,
                secret: auth.shared_secret.clone(),
                newly_paired: false,
            })
        }
        Line::AuthOk { uuid, .. } => Err(Error::Handshake(format!(
            "auth acknowledged by unexpected device {uuid}"
        ))),
        other => Err(Error::Handshake(format!(
            "expected AUTH_OK, got {other:?}"
        ))),
    }
}

async fn initiate_pairing(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    identity: &DeviceIdentity,
    tcp_port: u16,
) -> Result<HandshakeResult> {
    let eph = EphemeralSecret::generate();
    let hello = local_hello(identity, tcp_port, &eph);
    write_line(writer, &hello.encode(false)).await?;

    match expect_line(reader).await? {
        Line::HelloAck(ack) => {
            verify_hello(&ack)?;
            let shared = eph.diffie_hellman(&ExchangeKey::from_bytes(ack.exchange_key));
            Ok(HandshakeResult {
                peer_uuid: ack.uuid,
                display_name: ack.display_name,
                device_type: ack.device_type,
                tcp_port: ack.tcp_port,
                secret: SharedSecret::derive(&shared),
                newly_paired: true,
            })
        }
        other => Err(Error::Handshake(format!(
            "expected HELLO_ACK, got {other:?}"
        ))),
    }
}

/// Inbound handshake: answer whichever opening the peer chose.
pub async fn respond(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    identity: &DeviceIdentity,
    tcp_port: u16,
    trust: &TrustStore,
) -> Result<HandshakeResult> {
    match expect_line(reader).await? {
        Line::Hello(hello) => {
            verify_hello(&hello)?;
            let eph = EphemeralSecret::generate();
            let ack = local_hello(identity, tcp_port, &eph);
            write_line(writer, &ack.encode(true)).await?;
            let shared = eph.diffie_hellman(&ExchangeKey::from_bytes(hello.exchange_key));
            Ok(HandshakeResult {
                peer_uuid: hello.uuid,
                display_name: hello.display_name,
                device_type: hello.device_type,
                tcp_port: hello.tcp_port,
                secret: SharedSecret::derive(&shared),
                newly_paired: true,
            })
        }
        Line::Auth { uuid, proof } => {
            let auth = trust
                .get(&uuid)
                .await
                .ok_or(Error::NotTrusted(uuid))?;
            let proof = open_proof(&auth.shared_secret, &proof)?;
            let sealed = local_proof(identity, tcp_port, &auth.shared_secret)?;
            write_line(writer, &encode_auth(identity.uuid, &sealed, true)).await?;
            Ok(HandshakeResult {
                peer_uuid: uuid,
                display_name: proof.display_name,
                device_type: proof.device_type,
                tcp_port: proof.tcp_port,
                secret: auth.shared_secret.clone(),
                newly_paired: false,
            })
        }
        other => Err(Error::Handshake(format!(
            "session opened with {other:?} before handshake"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::DeviceType;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::{TcpListener, TcpStream};

    fn identity(name: &str, device_type: DeviceType) -> DeviceIdentity {
        DeviceIdentity::generate(name.to_string(), device_type)
    }

    async fn split_pair() -> (
        (BufReader<OwnedReadHalf>, OwnedWriteHalf),
        (BufReader<OwnedReadHalf>, OwnedWriteHalf),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (cr, cw) = client.into_split();
        let (sr, sw) = server.into_split();
        ((BufReader::new(cr), cw), (BufReader::new(sr), sw))
    }

    #[tokio::test]
    async fn pairing_handshake_agrees_on_secret() {
        let a = identity("laptop", DeviceType::Pc);
        let b = identity("phone", DeviceType::Phone);
        let ((mut ar, mut aw), (mut br, mut bw)) = split_pair().await;

        let b_trust = TrustStore::load(std::env::temp_dir().join(format!(
            "lanlink-test-{}.json",
            Uuid::new_v4()
        )))
        .await;

        let b_uuid = b.uuid;
        let initiator = tokio::spawn(async move {
            initiate(&mut ar, &mut aw, &a, 1111, None).await.unwrap()
        });
        let responder = respond(&mut br, &mut bw, &b, 2222, &b_trust).await.unwrap();
        let initiated = initiator.await.unwrap();

        assert!(initiated.newly_paired);
        assert!(responder.newly_paired);
        assert_eq!(initiated.peer_uuid, b_uuid);
        assert_eq!(initiated.tcp_port, 2222);
        assert_eq!(responder.tcp_port, 1111);

        let sealed = initiated.secret.seal(b"cross-check").unwrap();
        assert_eq!(responder.secret.open(&sealed).unwrap(), b"cross-check");
    }

    #[tokio::test]
    async fn auth_handshake_with_stored_secret() {
        let a = identity("laptop", DeviceType::Pc);
        let b = identity("phone", DeviceType::Phone);
        let secret = SharedSecret::from_bytes([3u8; 32]);

        let a_record = AuthInfo {
            uuid: b.uuid,
            display_name: "phone".to_string(),
            shared_secret: secret.clone(),
            last_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            last_port: 2222,
            device_type: DeviceType::Phone,
            is_accepted: true,
        };

        let b_trust = TrustStore::load(std::env::temp_dir().join(format!(
            "lanlink-test-{}.json",
            Uuid::new_v4()
        )))
        .await;
        b_trust
            .upsert(AuthInfo {
                uuid: a.uuid,
                display_name: "laptop".to_string(),
                shared_secret: secret.clone(),
                last_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                last_port: 1111,
                device_type: DeviceType::Pc,
                is_accepted: true,
            })
            .await
            .unwrap();

        let ((mut ar, mut aw), (mut br, mut bw)) = split_pair().await;

        let initiator = tokio::spawn(async move {
            initiate(&mut ar, &mut aw, &a, 1111, Some(&a_record))
                .await
                .unwrap()
        });
        let responder = respond(&mut br, &mut bw, &b, 2222, &b_trust).await.unwrap();
        let initiated = initiator.await.unwrap();

        assert!(!initiated.newly_paired);
        assert!(!responder.newly_paired);
        assert_eq!(responder.display_name, "laptop");
        assert_eq!(initiated.display_name, "phone");
    }

    #[tokio::test]
    async fn auth_from_stranger_is_rejected() {
        let a = identity("laptop", DeviceType::Pc);
        let b = identity("phone", DeviceType::Phone);
        let a_record = AuthInfo {
            uuid: b.uuid,
            display_name: "phone".to_string(),
            shared_secret: SharedSecret::from_bytes([9u8; 32]),
            last_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            last_port: 2222,
            device_type: DeviceType::Phone,
            is_accepted: true,
        };

        // Responder has no record of the initiator.
        let b_trust = TrustStore::load(std::env::temp_dir().join(format!(
            "lanlink-test-{}.json",
            Uuid::new_v4()
        )))
        .await;

        let ((mut ar, mut aw), (mut br, mut bw)) = split_pair().await;
        let initiator = tokio::spawn(async move {
            initiate(&mut ar, &mut aw, &a, 1111, Some(&a_record)).await
        });
        let responded = respond(&mut br, &mut bw, &b, 2222, &b_trust).await;
        assert!(responded.is_err());
        drop(bw);
        assert!(initiator.await.unwrap().is_err());
    }

    #[test]
    fn stale_proof_rejected() {
        let secret = SharedSecret::from_bytes([5u8; 32]);
        let proof = AuthProof {
            time: now_millis() - 10 * 60 * 1000,
            display_name: "old".to_string(),
            device_type: DeviceType::Phone,
            tcp_port: 1,
        };
        let sealed = secret.seal(&serde_json::to_vec(&proof).unwrap()).unwrap();
        assert!(open_proof(&secret, &sealed).is_err());
    }
}
