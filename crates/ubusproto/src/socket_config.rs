//! ZMQ socket setup shared by the bus server and its clients.
//!
//! All socket creation goes through these helpers so both ends carry the
//! same options.
//!
//! ## Workarounds Applied
//!
//! - `LINGER` set to 0 for clean shutdown
//! - `RECONNECT_IVL_MAX` capped at 60s to prevent runaway backoff
//! - ROUTER replies are sent frame by frame (rzmq ROUTER `send_multipart`
//!   drops frames)

use anyhow::{Context, Result};
use bytes::Bytes;
use rzmq::socket::options::{LINGER, RECONNECT_IVL, RECONNECT_IVL_MAX, ROUTER_MANDATORY, ROUTING_ID};
use rzmq::{Msg, MsgFlags, Socket, SocketType};
use tracing::warn;

/// Default reconnect interval in milliseconds
pub const DEFAULT_RECONNECT_IVL_MS: i32 = 1000;

/// Maximum reconnect interval in milliseconds (60 seconds)
pub const DEFAULT_RECONNECT_IVL_MAX_MS: i32 = 60_000;

/// Apply LINGER and reconnect options. Failures are logged, not fatal.
pub async fn configure_socket(socket: &Socket, name: &str) {
    if let Err(e) = socket.set_option_raw(LINGER, &0i32.to_ne_bytes()).await {
        warn!("{}: Failed to set LINGER: {}", name, e);
    }

    if let Err(e) = socket
        .set_option_raw(RECONNECT_IVL, &DEFAULT_RECONNECT_IVL_MS.to_ne_bytes())
        .await
    {
        warn!("{}: Failed to set RECONNECT_IVL: {}", name, e);
    }

    if let Err(e) = socket
        .set_option_raw(RECONNECT_IVL_MAX, &DEFAULT_RECONNECT_IVL_MAX_MS.to_ne_bytes())
        .await
    {
        warn!("{}: Failed to set RECONNECT_IVL_MAX: {}", name, e);
    }
}

/// Create a ROUTER socket with ROUTER_MANDATORY, then bind.
pub async fn create_router_and_bind(
    ctx: &rzmq::Context,
    endpoint: &str,
    name: &str,
) -> Result<Socket> {
    let socket = ctx
        .socket(SocketType::Router)
        .with_context(|| format!("Failed to create {} ROUTER socket", name))?;

    configure_socket(&socket, name).await;

    // report unroutable replies instead of silently dropping them
    if let Err(e) = socket
        .set_option_raw(ROUTER_MANDATORY, &1i32.to_ne_bytes())
        .await
    {
        warn!("{}: Failed to set ROUTER_MANDATORY: {}", name, e);
    }

    socket
        .bind(endpoint)
        .await
        .with_context(|| format!("Failed to bind {} socket to {}", name, endpoint))?;

    Ok(socket)
}

/// Create a DEALER socket with a routing identity, then connect.
///
/// connect() does not wait for the peer; ZMQ connects when it appears.
pub async fn create_dealer_and_connect(
    ctx: &rzmq::Context,
    endpoint: &str,
    identity: &[u8],
    name: &str,
) -> Result<Socket> {
    let socket = ctx
        .socket(SocketType::Dealer)
        .with_context(|| format!("Failed to create {} DEALER socket", name))?;

    configure_socket(&socket, name).await;

    if let Err(e) = socket.set_option_raw(ROUTING_ID, identity).await {
        warn!("{}: Failed to set ROUTING_ID: {}", name, e);
    }

    socket
        .connect(endpoint)
        .await
        .with_context(|| format!("Failed to connect {} socket to {}", name, endpoint))?;

    Ok(socket)
}

pub fn frames_to_msgs(frames: &[Bytes]) -> Vec<Msg> {
    frames.iter().map(|f| Msg::from_vec(f.to_vec())).collect()
}

pub fn msgs_to_frames(msgs: Vec<Msg>) -> Vec<Bytes> {
    msgs.into_iter()
        .map(|m| Bytes::from(m.data().map(|d| d.to_vec()).unwrap_or_default()))
        .collect()
}

/// Send multipart using individual send() calls with MORE flags.
pub async fn send_multipart_individually(socket: &Socket, msgs: Vec<Msg>) -> Result<()> {
    let last_idx = msgs.len().saturating_sub(1);
    for (i, mut msg) in msgs.into_iter().enumerate() {
        if i < last_idx {
            msg.set_flags(MsgFlags::MORE);
        }
        socket
            .send(msg)
            .await
            .with_context(|| format!("Failed to send frame {} of multipart", i))?;
    }
    Ok(())
}
