//! Handshake orchestrator shared by the client and server roles.
//!
//! Phases, in order:
//!
//! 1. Hello exchange: version, options (exact match) and suite selection by
//!    the server's fixed priority.
//! 2. Key exchange: ephemeral keys, gated by PSK tags when required. The
//!    server checks the client's tag before revealing its own.
//! 3. Master key derivation from the shared secret and both nonces.
//! 4. Enable encryption: new sealer and opener installed together.
//! 5. Identity authentication (identity suites only): the client first when
//!    client authentication is required, then always the server.
//! 6. Completion: the client confirms with a `Success` status packet.
//!
//! On failure the status code is sent to the peer best-effort, raw before
//! phase 4 and sealed after it.

use std::net::SocketAddr;

use channeltrust::crypto::cipher::session_ciphers;
use channeltrust::crypto::kdf::{
    derive_iv, derive_master_key, psk_tag, random_nonce, verify_psk_tag, Nonce,
};
use channeltrust::crypto::key_agreement::EphemeralKeyPair;
use channeltrust::crypto::keys::verify_signature;
use channeltrust::identity::is_identity_valid;
use channeltrust::{ChannelOptions, CipherSuite, CipherSuites, Identity, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ChannelConfig, Credentials, Role};
use crate::error::{reject, ChannelError, Result};
use crate::message::{Authentication, Hello, KeyExchange, StatusPacket, PROTOCOL_VERSION};
use crate::session::{ReadSide, WriteSide};

/// Everything one handshake run needs to know about its side.
pub struct HandshakeContext<'a> {
    pub role: Role,
    pub config: &'a ChannelConfig,
    pub credentials: &'a Credentials,
    pub remote: Option<SocketAddr>,
    /// Identity authenticated by an earlier handshake on this channel. A
    /// renegotiation must authenticate the same peer.
    pub pinned_identity: Option<Identity>,
    pub renegotiation: bool,
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub cipher_suite: CipherSuite,
    pub peer_identity: Option<Identity>,
    pub key_id: [u8; 8],
}

/// Run the handshake as `ctx.role`.
///
/// Transport failures are returned as they are. Every other failure is
/// reported to the peer when its code allows and returned as
/// [`ChannelError::Secure`] carrying the remote endpoint and, once known,
/// the peer identity.
pub async fn run<R, W>(
    read: &mut ReadSide<R>,
    write: &mut WriteSide<W>,
    ctx: &HandshakeContext<'_>,
) -> Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut peer_identity = None;
    match negotiate(read, write, ctx, &mut peer_identity).await {
        Ok(outcome) => {
            write.stats().reset();
            tracing::info!(
                role = %ctx.role,
                suite = %outcome.cipher_suite,
                key_id = %hex::encode(outcome.key_id),
                peer = ?outcome.peer_identity,
                renegotiation = ctx.renegotiation,
                "secure session established"
            );
            Ok(outcome)
        }
        Err(err) if err.is_transport() => {
            tracing::warn!(role = %ctx.role, error = %err, "handshake aborted by transport");
            Err(err)
        }
        Err(err) => {
            let code = err.status_code();
            if err.is_reported_to_peer() {
                if let Err(notify) = write.send_status(code).await {
                    tracing::debug!(%code, error = %notify, "failed to report handshake failure");
                }
            }
            let err = err
                .into_secure()
                .with_endpoint(ctx.remote)
                .with_peer_identity(peer_identity);
            tracing::warn!(role = %ctx.role, error = %err, "handshake failed");
            Err(ChannelError::Secure(err))
        }
    }
}

/// Nonces of one handshake, named by who generated them.
struct Nonces {
    client: Nonce,
    server: Nonce,
}

impl Nonces {
    fn own(&self, role: Role) -> &Nonce {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    fn peer(&self, role: Role) -> &Nonce {
        match role {
            Role::Client => &self.server,
            Role::Server => &self.client,
        }
    }

    /// `ephemeral_public || server_nonce || client_nonce`
    fn signed_data(&self, ephemeral_public: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(ephemeral_public.len() + 64);
        data.extend_from_slice(ephemeral_public);
        data.extend_from_slice(&self.server);
        data.extend_from_slice(&self.client);
        data
    }
}

async fn negotiate<R, W>(
    read: &mut ReadSide<R>,
    write: &mut WriteSide<W>,
    ctx: &HandshakeContext<'_>,
    peer_identity: &mut Option<Identity>,
) -> Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let role = ctx.role;
    let options = ctx.config.options;

    // 1. Hello
    let (suite, nonces) = exchange_hello(read, write, ctx).await?;
    tracing::debug!(%role, %suite, "hello exchange complete");

    // 2. Key exchange
    let ephemeral = EphemeralKeyPair::generate(suite.key_agreement())?;
    let psk = if options.contains(ChannelOptions::PRE_SHARED_KEY_AUTHENTICATION_REQUIRED) {
        Some(ctx.credentials.pre_shared_key.as_ref().ok_or_else(|| {
            ChannelError::Config("pre-shared key authentication required but no key".into())
        })?)
    } else {
        None
    };
    let own_kx = KeyExchange {
        ephemeral_public: ephemeral.public_key_bytes().to_vec(),
        psk_tag: match psk {
            Some(psk) => psk_tag(psk, ephemeral.public_key_bytes(), &nonces.server, &nonces.client)?,
            None => Vec::new(),
        },
    };
    let check_peer_tag = |kx: &KeyExchange| -> Result<()> {
        match psk {
            Some(psk) => verify_psk_tag(
                psk,
                &kx.ephemeral_public,
                &nonces.server,
                &nonces.client,
                &kx.psk_tag,
            )
            .map_err(|_| {
                reject(
                    StatusCode::PskAuthenticationFailed,
                    "pre-shared key tag missing or incorrect",
                )
            }),
            None => Ok(()),
        }
    };
    let peer_kx = match role {
        Role::Client => {
            write.send_message(&own_kx).await?;
            let kx: KeyExchange = read.read_message().await?;
            check_peer_tag(&kx)?;
            kx
        }
        Role::Server => {
            let kx: KeyExchange = read.read_message().await?;
            check_peer_tag(&kx)?;
            write.send_message(&own_kx).await?;
            kx
        }
    };
    tracing::debug!(%role, psk = psk.is_some(), "key exchange complete");

    // 3. Master key
    let shared = ephemeral.agree(&peer_kx.ephemeral_public)?;
    let master = derive_master_key(&shared, &nonces.server, &nonces.client);

    // 4. Enable encryption
    let (sealer, opener) = session_ciphers(
        &master,
        &derive_iv(nonces.own(role)),
        &derive_iv(nonces.peer(role)),
    )?;
    write.install(sealer);
    read.install(opener);
    tracing::debug!(%role, "encryption enabled");

    // 5. Identity authentication
    if suite.requires_identity() {
        let client_auth = options.contains(ChannelOptions::CLIENT_AUTHENTICATION_REQUIRED);
        let own_proof = || authentication(ctx, &nonces, &own_kx.ephemeral_public);
        let peer_signed = nonces.signed_data(&peer_kx.ephemeral_public);
        match role {
            Role::Client => {
                if client_auth {
                    write.send_message(&own_proof()?).await?;
                }
                let auth: Authentication = read.read_message().await?;
                verify_peer(&auth, &peer_signed, ctx, peer_identity)?;
            }
            Role::Server => {
                if client_auth {
                    let auth: Authentication = read.read_message().await?;
                    verify_peer(&auth, &peer_signed, ctx, peer_identity)?;
                }
                write.send_message(&own_proof()?).await?;
            }
        }
        tracing::debug!(%role, peer = ?peer_identity, "identity authentication complete");
    }

    // 6. Completion
    match role {
        Role::Client => write.send_message(&StatusPacket(StatusCode::Success)).await?,
        Role::Server => {
            let _: StatusPacket = read.read_message().await?;
        }
    }

    Ok(HandshakeOutcome {
        cipher_suite: suite,
        peer_identity: *peer_identity,
        key_id: master.key_id(),
    })
}

async fn exchange_hello<R, W>(
    read: &mut ReadSide<R>,
    write: &mut WriteSide<W>,
    ctx: &HandshakeContext<'_>,
) -> Result<(CipherSuite, Nonces)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let options = ctx.config.options;
    let own_nonce = random_nonce();

    let check_peer = |hello: &Hello| -> Result<()> {
        if hello.version != PROTOCOL_VERSION {
            return Err(reject(
                StatusCode::ProtocolVersionNotSupported,
                format!("unsupported protocol version {}", hello.version),
            ));
        }
        if hello.options != options {
            return Err(reject(
                StatusCode::NoMatchingOptionsAvailable,
                format!(
                    "peer options {:#04x} differ from local {:#04x}",
                    hello.options.bits(),
                    options.bits()
                ),
            ));
        }
        Ok(())
    };

    match ctx.role {
        Role::Client => {
            let offer = ctx.config.cipher_suites;
            write
                .send_message(&Hello {
                    version: PROTOCOL_VERSION,
                    nonce: own_nonce,
                    cipher_suites: offer,
                    options,
                })
                .await?;
            let reply: Hello = read.read_message().await?;
            check_peer(&reply)?;
            let suite = reply
                .cipher_suites
                .single()
                .filter(|suite| offer.contains(*suite))
                .ok_or_else(|| {
                    reject(
                        StatusCode::NoMatchingCipherAvailable,
                        format!(
                            "server selected {:#04x}, not exactly one offered suite",
                            reply.cipher_suites.bits()
                        ),
                    )
                })?;
            Ok((
                suite,
                Nonces {
                    client: own_nonce,
                    server: reply.nonce,
                },
            ))
        }
        Role::Server => {
            let offer: Hello = read.read_message().await?;
            check_peer(&offer)?;
            let servable = ctx.config.servable_suites(Role::Server, ctx.credentials);
            let suite = offer
                .cipher_suites
                .intersection(servable)
                .preferred()
                .ok_or_else(|| {
                    reject(
                        StatusCode::NoMatchingCipherAvailable,
                        format!(
                            "no common cipher suite (offered {:#04x}, served {:#04x})",
                            offer.cipher_suites.bits(),
                            servable.bits()
                        ),
                    )
                })?;
            write
                .send_message(&Hello {
                    version: PROTOCOL_VERSION,
                    nonce: own_nonce,
                    cipher_suites: CipherSuites::from(suite),
                    options,
                })
                .await?;
            Ok((
                suite,
                Nonces {
                    client: offer.nonce,
                    server: own_nonce,
                },
            ))
        }
    }
}

/// Build this side's identity proof.
fn authentication(
    ctx: &HandshakeContext<'_>,
    nonces: &Nonces,
    own_ephemeral: &[u8],
) -> Result<Authentication> {
    let keys = ctx.credentials.identity.as_ref().ok_or_else(|| {
        ChannelError::Config(format!("{} must authenticate but has no identity", ctx.role))
    })?;
    Ok(Authentication {
        identity: keys.identity(),
        public_key: keys.public_key_bytes().to_vec(),
        signature: keys.sign(&nonces.signed_data(own_ephemeral)).to_vec(),
    })
}

/// Check a peer's identity proof: derivation, signature, then trust.
fn verify_peer(
    auth: &Authentication,
    signed: &[u8],
    ctx: &HandshakeContext<'_>,
    peer_identity: &mut Option<Identity>,
) -> Result<()> {
    if !is_identity_valid(&auth.public_key, auth.identity.as_bytes()) {
        return Err(reject(
            StatusCode::PeerAuthenticationFailed,
            format!("identity {} is not derived from the presented key", auth.identity),
        ));
    }
    verify_signature(&auth.public_key, signed, &auth.signature).map_err(|_| {
        reject(
            StatusCode::PeerAuthenticationFailed,
            "signature over handshake nonces does not verify",
        )
    })?;
    *peer_identity = Some(auth.identity);

    if let Some(trusted) = &ctx.credentials.trusted_identities {
        if !trusted.contains(&auth.identity) {
            return Err(reject(
                StatusCode::UntrustedRemotePeerUserId,
                format!("identity {} is not trusted", auth.identity),
            ));
        }
    }
    if let Some(pinned) = ctx.pinned_identity {
        if pinned != auth.identity {
            return Err(reject(
                StatusCode::PeerAuthenticationFailed,
                format!("peer identity changed from {pinned} to {}", auth.identity),
            ));
        }
    }
    Ok(())
}
