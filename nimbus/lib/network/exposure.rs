use rand::Rng;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The header a client presents the traffic token in when public traffic is disabled.
pub const TRAFFIC_TOKEN_HEADER: &str = "x-nimbus-traffic-access-token";

const TRAFFIC_TOKEN_BYTES: usize = 16;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the public host name for a guest port: `<port>-<sandbox id>.<domain>`.
pub fn host_for(port: u16, sandbox_id: &str, domain: &str) -> String {
    format!("{port}-{sandbox_id}.{domain}")
}

/// Splits a host produced by [`host_for`] back into port and sandbox id.
///
/// Returns `None` for hosts outside `domain` or that do not have the expected shape. A
/// `:port` suffix on the host is ignored.
pub fn parse_host(host: &str, domain: &str) -> Option<(u16, String)> {
    let host = host.split(':').next()?.trim_end_matches('.');
    let label = host.strip_suffix(domain)?.strip_suffix('.')?;
    if label.contains('.') {
        return None;
    }

    let (port, sandbox_id) = label.split_once('-')?;
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    if sandbox_id.is_empty() {
        return None;
    }

    Some((port, sandbox_id.to_string()))
}

/// Generates a fresh traffic access token: 32 lowercase hex characters.
pub fn new_traffic_token() -> String {
    let bytes: [u8; TRAFFIC_TOKEN_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
