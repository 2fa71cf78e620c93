//! Shaping transmitter. Writes upstream bytes as size-bounded,
//! delay-jittered chunks, and applies TCP_NODELAY/TTL socket options once
//! per upstream connection. Grounded in
//! `original_source/proxy_tool/proxy_core.py::send_packet`/
//! `connect_upstream`; socket-option plumbing follows
//! `examples/Distracted-E421-nixos-cursor`'s use of `socket2`-family crates
//! for low-level options instead of raw `libc` calls.

use std::net::SocketAddr;

use rand::Rng;
use socket2::Socket;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::ShapingProfile;

/// Writes `data` to `writer` in `profile.fragment_size`-byte strides,
/// sleeping `uniform(min_delay_ms, max_delay_ms)` between writes when
/// `max_delay_ms > 0`. Writes the whole buffer in one call when fragmenting
/// is disabled or unnecessary.
pub async fn send<W>(writer: &mut W, data: &[u8], profile: &ShapingProfile) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if profile.fragment_size == 0 || data.len() <= profile.fragment_size as usize {
        writer.write_all(data).await?;
        writer.flush().await?;
        return Ok(());
    }

    let stride = profile.fragment_size as usize;
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + stride).min(data.len());
        writer.write_all(&data[offset..end]).await?;
        writer.flush().await?;
        offset = end;

        if offset < data.len() && profile.max_delay_ms > 0 {
            let delay_ms = rand::thread_rng().gen_range(profile.min_delay_ms..=profile.max_delay_ms);
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
        }
    }
    Ok(())
}

/// Connects to `addr` and applies `TCP_NODELAY` unconditionally, plus a
/// TTL/hop-limit clamp when `profile.ttl > 0`. A TTL-set failure is logged
/// and does not fail the connection.
pub async fn connect_upstream(
    addr: SocketAddr,
    profile: &ShapingProfile,
) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    if profile.ttl > 0 {
        let sock = Socket::from(stream.into_std()?);
        let set_result = if addr.is_ipv4() {
            sock.set_ttl(profile.ttl as u32)
        } else {
            sock.set_unicast_hops_v6(profile.ttl as u32)
        };
        if let Err(e) = set_result {
            tracing::warn!("failed to set TTL on upstream socket to {addr}: {e}");
        }
        return TcpStream::from_std(sock.into());
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_fragmentation_writes_whole_buffer() {
        let mut buf = Vec::new();
        let profile = ShapingProfile::default();
        send(&mut buf, b"hello world", &profile).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn fragments_preserve_byte_order_and_stride() {
        let data = vec![7u8; 100];
        let profile = ShapingProfile {
            fragment_size: 16,
            ..ShapingProfile::default()
        };
        let mut buf = Vec::new();
        send(&mut buf, &data, &profile).await.unwrap();
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn small_payload_under_fragment_size_is_a_single_write() {
        let data = vec![1u8; 4];
        let profile = ShapingProfile {
            fragment_size: 16,
            ..ShapingProfile::default()
        };
        let mut buf = Vec::new();
        send(&mut buf, &data, &profile).await.unwrap();
        assert_eq!(buf, data);
    }
}
