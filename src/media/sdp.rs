//! Connection-address correction for NAT-traversed SDP bodies.

use std::net::IpAddr;

use tracing::debug;

/// Substitute the connection address in an SDP body when the offered one
/// is private or otherwise unreachable and differs from `new_address`.
///
/// Ports and media attributes are left untouched. Returns the body
/// verbatim with `false` when it is not SDP, carries no connection line,
/// already matches, or advertises a reachable address.
pub fn mangle(body: &str, new_address: IpAddr) -> (String, bool) {
    if !body.starts_with("v=") {
        return (body.to_string(), false);
    }

    let newline = if body.contains("\r\n") { "\r\n" } else { "\n" };
    let mut rewritten = Vec::new();
    let mut changed = false;

    for line in body.lines() {
        let offered = line
            .strip_prefix("c=IN IP4 ")
            .map(|rest| (rest, "c=IN IP4"))
            .or_else(|| line.strip_prefix("c=IN IP6 ").map(|rest| (rest, "c=IN IP6")));

        if let Some((rest, prefix)) = offered {
            match rest.trim().parse::<IpAddr>() {
                Ok(address) if address != new_address && !is_reachable(&address) => {
                    debug!(offered = %address, replacement = %new_address, "mangling SDP connection address");
                    rewritten.push(format!("{prefix} {new_address}"));
                    changed = true;
                    continue;
                }
                _ => {}
            }
        }
        rewritten.push(line.to_string());
    }

    if !changed {
        return (body.to_string(), false);
    }

    let mut sdp = rewritten.join(newline);
    if body.ends_with('\n') {
        sdp.push_str(newline);
    }
    (sdp, true)
}

/// Whether the address is plausibly reachable from the far side, i.e. not
/// RFC 1918 private space, loopback, link-local or unspecified.
fn is_reachable(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=call\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 0\r\n";

    #[test]
    fn rewrites_private_connection_address() {
        let replacement: IpAddr = "203.0.113.7".parse().unwrap();
        let (mangled, changed) = mangle(OFFER, replacement);
        assert!(changed);
        assert!(mangled.contains("c=IN IP4 203.0.113.7"));
        // Ports and origin line untouched.
        assert!(mangled.contains("m=audio 49170 RTP/AVP 0"));
        assert!(mangled.contains("o=- 1 1 IN IP4 10.0.0.5"));
    }

    #[test]
    fn public_address_is_left_alone() {
        let body = OFFER.replace("c=IN IP4 10.0.0.5", "c=IN IP4 198.51.100.4");
        let replacement: IpAddr = "203.0.113.7".parse().unwrap();
        let (mangled, changed) = mangle(&body, replacement);
        assert!(!changed);
        assert_eq!(mangled, body);
    }

    #[test]
    fn mangle_is_idempotent_once_matching() {
        let replacement: IpAddr = "203.0.113.7".parse().unwrap();
        let (first, changed) = mangle(OFFER, replacement);
        assert!(changed);
        let (second, changed_again) = mangle(&first, replacement);
        assert!(!changed_again);
        assert_eq!(first, second);
    }

    #[test]
    fn non_sdp_body_is_untouched() {
        let replacement: IpAddr = "203.0.113.7".parse().unwrap();
        let (out, changed) = mangle("hello c=IN IP4 10.0.0.5", replacement);
        assert!(!changed);
        assert_eq!(out, "hello c=IN IP4 10.0.0.5");
    }

    #[test]
    fn bare_newlines_are_preserved() {
        let body = OFFER.replace("\r\n", "\n");
        let replacement: IpAddr = "203.0.113.7".parse().unwrap();
        let (mangled, changed) = mangle(&body, replacement);
        assert!(changed);
        assert!(!mangled.contains("\r\n"));
        assert!(mangled.ends_with('\n'));
    }
}
