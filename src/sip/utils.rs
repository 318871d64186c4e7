use std::net::SocketAddr;

use rand::Rng;

pub(crate) fn format_socket_for_sip(addr: &SocketAddr) -> String {
    match addr.ip() {
        std::net::IpAddr::V6(ipv6) => format!("[{}]:{}", ipv6, addr.port()),
        std::net::IpAddr::V4(ipv4) => format!("{}:{}", ipv4, addr.port()),
    }
}

/// Opaque handle for dialogues, bridges and CDRs.
pub(crate) fn new_id() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("{value:032x}")
}

/// RFC 3261 magic-cookie branch for a fresh Via.
pub(crate) fn new_branch() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("z9hG4bK{value:016x}")
}

/// Minimal percent-decoding for Replaces values and Refer-To fragments.
/// Malformed escapes are kept verbatim rather than rejected.
pub(crate) fn unescape_uri_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            if let Some(pair) = bytes.get(index + 1..index + 3) {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(pair).unwrap_or(""), 16) {
                    decoded.push(byte);
                    index += 3;
                    continue;
                }
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Scan for an extension header carried as `Header::Other`, the same way
/// P-headers are read off requests.
pub(crate) fn other_header_value(headers: &rsip::Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|header| match header {
        rsip::Header::Other(header_name, value) if header_name.eq_ignore_ascii_case(name) => {
            Some(value.trim().to_string())
        }
        _ => None,
    })
}

pub(crate) fn apply_user_agent(headers: &mut rsip::Headers, value: &str) {
    headers.retain(|header| {
        !matches!(header, rsip::Header::UserAgent(_))
            && !matches!(
                header,
                rsip::Header::Other(name, _) if name.eq_ignore_ascii_case("User-Agent")
            )
    });
    headers.push(rsip::Header::UserAgent(rsip::headers::UserAgent::from(
        value.to_string(),
    )));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_decodes_common_escapes() {
        assert_eq!(unescape_uri_component("abc%40host"), "abc@host");
        assert_eq!(
            unescape_uri_component("a%3Bto-tag%3Dt"),
            "a;to-tag=t".to_string()
        );
        assert_eq!(unescape_uri_component("plain"), "plain");
    }

    #[test]
    fn unescape_keeps_malformed_escapes() {
        assert_eq!(unescape_uri_component("50%"), "50%");
        assert_eq!(unescape_uri_component("50%zz"), "50%zz");
    }

    #[test]
    fn branch_carries_magic_cookie() {
        let branch = new_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert_ne!(branch, new_branch());
    }
}
