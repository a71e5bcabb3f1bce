//! Default gateway lookup, the last resort when the agent is neither
//! configured nor on `localhost` (typically a container talking to the agent
//! on its host).

use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// Parses the text of `/proc/net/route` and returns the default route's
/// gateway.
///
/// Columns are whitespace separated; `Destination` and `Gateway` are
/// little-endian hex. The first line is a header.
pub fn parse_default_gateway(route_table: &str) -> Option<Ipv4Addr> {
    route_table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let _iface = fields.next()?;
        let destination = fields.next()?;
        let gateway = fields.next()?;
        if destination != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    })
}

/// Reads `path` and returns its default gateway, or `None` when the table is
/// missing or has no default route.
pub async fn default_gateway(path: &Path) -> Option<Ipv4Addr> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_default_gateway(&contents),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cannot read routing table");
            None
        }
    }
}
