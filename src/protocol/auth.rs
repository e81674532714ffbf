//! Password handshake executed at connect time.
//!
//! The client opens with AUTH_REQUEST carrying a hex SHA-256 of the shared
//! password plus its identity; the server answers AUTH_SUCCESS with a fresh
//! session token or AUTH_FAILURE with `retry_allowed = false`. Both sides
//! run under the configured `auth_timeout`, and each connection gets exactly
//! one attempt.
//!
//! A bare hash of a shared secret is the documented on-wire contract; it is
//! weak against offline attack, so deployments must use trusted networks or
//! terminate TLS below this layer.

use crate::config::ClientConfig;
use crate::core::frame::{Frame, FrameType};
use crate::core::payload::{
    self, AuthFailurePayload, AuthRequestPayload, AuthSuccessPayload, PeerInfo,
};
use crate::error::{constants, ConduitError, Result};
use crate::transport::{FrameReader, FrameWriter};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Opaque token issued by the server; advisory across reconnects
    pub session_token: String,
    /// The remote endpoint's announced identity
    pub peer: PeerInfo,
}

/// Hex-encoded SHA-256 of the shared password.
pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    to_hex(&digest)
}

/// Random 32-byte session token, hex encoded.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Client side: send AUTH_REQUEST, await the verdict.
pub async fn authenticate_client(
    writer: &mut FrameWriter,
    reader: &mut FrameReader,
    config: &ClientConfig,
) -> Result<AuthSession> {
    let request = AuthRequestPayload {
        password_hash: hash_password(&config.password),
        client_info: PeerInfo {
            name: config.name.clone(),
            version: config.version.clone(),
        },
    };
    writer
        .send(Frame::new(
            FrameType::AuthRequest,
            0,
            payload::encode(&request)?,
        ))
        .await?;

    let frame = match reader.next_timeout(config.auth_timeout).await {
        Ok(frame) => frame,
        Err(ConduitError::Timeout) => {
            return Err(ConduitError::AuthenticationFailed {
                reason: constants::ERR_AUTH_TIMEOUT.into(),
                retry_allowed: false,
            })
        }
        Err(e) => return Err(e),
    };

    match frame.frame_type {
        FrameType::AuthSuccess => {
            let body: AuthSuccessPayload = payload::decode(&frame.payload)?;
            debug!(server = %body.server_info.name, "Authenticated");
            Ok(AuthSession {
                session_token: body.session_token,
                peer: body.server_info,
            })
        }
        FrameType::AuthFailure => {
            let body: AuthFailurePayload = payload::decode(&frame.payload)?;
            warn!(reason = %body.reason, "Authentication rejected");
            Err(ConduitError::AuthenticationFailed {
                reason: body.reason,
                retry_allowed: body.retry_allowed,
            })
        }
        other => Err(ConduitError::AuthenticationFailed {
            reason: format!("Unexpected frame during handshake: {other:?}"),
            retry_allowed: false,
        }),
    }
}

/// Server side: read exactly one frame, verify, answer.
///
/// Any failure path emits AUTH_FAILURE with `retry_allowed = false`
/// before returning the error; the caller closes the transport.
pub async fn authenticate_server(
    writer: &mut FrameWriter,
    reader: &mut FrameReader,
    expected_hash: &str,
    server_info: PeerInfo,
    auth_timeout: Duration,
) -> Result<AuthSession> {
    let frame = match reader.next_timeout(auth_timeout).await {
        Ok(frame) => frame,
        Err(ConduitError::Timeout) => {
            return Err(ConduitError::AuthenticationFailed {
                reason: constants::ERR_AUTH_TIMEOUT.into(),
                retry_allowed: false,
            })
        }
        Err(e) => return Err(e),
    };

    if frame.frame_type != FrameType::AuthRequest {
        reject(writer, constants::ERR_AUTH_UNEXPECTED_FRAME).await;
        return Err(ConduitError::AuthenticationFailed {
            reason: constants::ERR_AUTH_UNEXPECTED_FRAME.into(),
            retry_allowed: false,
        });
    }

    let request: AuthRequestPayload = match payload::decode(&frame.payload) {
        Ok(request) => request,
        Err(_) => {
            reject(writer, constants::ERR_AUTH_UNEXPECTED_FRAME).await;
            return Err(ConduitError::AuthenticationFailed {
                reason: "Malformed AUTH_REQUEST payload".into(),
                retry_allowed: false,
            });
        }
    };

    if request.password_hash != expected_hash {
        reject(writer, constants::ERR_AUTH_BAD_PASSWORD).await;
        return Err(ConduitError::AuthenticationFailed {
            reason: constants::ERR_AUTH_BAD_PASSWORD.into(),
            retry_allowed: false,
        });
    }

    let session_token = generate_session_token();
    let response = AuthSuccessPayload {
        session_token: session_token.clone(),
        server_info,
    };
    writer
        .send(Frame::new(
            FrameType::AuthSuccess,
            0,
            payload::encode(&response)?,
        ))
        .await?;

    debug!(client = %request.client_info.name, "Client authenticated");
    Ok(AuthSession {
        session_token,
        peer: request.client_info,
    })
}

/// Best-effort rejection; the connection is being torn down either way.
async fn reject(writer: &mut FrameWriter, reason: &str) {
    let body = AuthFailurePayload {
        reason: reason.into(),
        retry_allowed: false,
    };
    if let Ok(bytes) = payload::encode(&body) {
        let _ = writer
            .send(Frame::new(FrameType::AuthFailure, 0, bytes))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::core::codec::FrameCodec;
    use crate::transport;

    #[test]
    fn password_hash_is_hex_sha256() {
        let hash = hash_password("kaede123");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_password("kaede123"));
        assert_ne!(hash, hash_password("kaede124"));
    }

    #[test]
    fn session_tokens_are_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    async fn loopback_pair() -> (
        (FrameWriter, FrameReader),
        (FrameWriter, FrameReader),
    ) {
        let listener = transport::bind("127.0.0.1", 0, false, 0).await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            transport::split(stream, FrameCodec::new(), Duration::from_secs(5))
        });
        let stream = transport::connect(
            "127.0.0.1",
            addr.port(),
            false,
            Duration::from_secs(5),
            0,
        )
        .await
        .expect("connect");
        let client = transport::split(stream, FrameCodec::new(), Duration::from_secs(5));
        let server = accept.await.expect("accept task");
        (client, server)
    }

    #[tokio::test]
    async fn handshake_succeeds_with_matching_password() {
        let ((mut cw, mut cr), (mut sw, mut sr)) = loopback_pair().await;
        let server_config = ServerConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        let client_config = ClientConfig {
            password: "hunter2".into(),
            ..Default::default()
        };

        let expected = hash_password(&server_config.password);
        let info = PeerInfo {
            name: server_config.name.clone(),
            version: server_config.version.clone(),
        };
        let server_task = tokio::spawn(async move {
            authenticate_server(&mut sw, &mut sr, &expected, info, Duration::from_secs(5)).await
        });

        let session = authenticate_client(&mut cw, &mut cr, &client_config)
            .await
            .expect("client side");
        let server_session = server_task
            .await
            .expect("join")
            .expect("server side");

        assert_eq!(session.session_token, server_session.session_token);
        assert_eq!(session.peer.name, "conduit-server");
        assert_eq!(server_session.peer.name, "conduit-client");
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_password() {
        let ((mut cw, mut cr), (mut sw, mut sr)) = loopback_pair().await;
        let client_config = ClientConfig {
            password: "wrong".into(),
            ..Default::default()
        };

        let expected = hash_password("right");
        let info = PeerInfo {
            name: "srv".into(),
            version: "1".into(),
        };
        let server_task = tokio::spawn(async move {
            authenticate_server(&mut sw, &mut sr, &expected, info, Duration::from_secs(5)).await
        });

        let err = authenticate_client(&mut cw, &mut cr, &client_config)
            .await
            .expect_err("must fail");
        match err {
            ConduitError::AuthenticationFailed { retry_allowed, .. } => {
                assert!(!retry_allowed)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(server_task.await.expect("join").is_err());
    }
}
