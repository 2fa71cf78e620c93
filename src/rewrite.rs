//! Header rewriter. Operates on raw HTTP/1.x request-head bytes — never on
//! a parsed request type — so it can pass malformed input through
//! untouched rather than failing the connection. Grounded in
//! `original_source/proxy_tool/proxy_core.py::modify_headers`, carried in
//! the byte-oriented style of `examples/Distracted-E421-nixos-cursor`'s
//! `injection.rs`.

use rand::Rng;

use crate::config::RewriteProfile;

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())]
}

/// Rewrites a request-head chunk per `profile`. Never fails: on any parse
/// anomaly (non-UTF-8, no recognizable structure) the input is returned
/// unchanged.
pub fn modify(chunk: &[u8], profile: &RewriteProfile) -> Vec<u8> {
    let text = match std::str::from_utf8(chunk) {
        Ok(t) => t,
        Err(_) => return chunk.to_vec(),
    };

    let lines: Vec<&str> = text.split("\r\n").collect();
    if lines.is_empty() {
        return chunk.to_vec();
    }

    // Index of the blank line separating headers from body, if present in
    // this chunk at all; a chunk boundary can split headers from body
    // across separate reads, in which case there is none here.
    let header_end = lines.iter().position(|l| l.is_empty());
    let (header_lines_end, body_lines): (usize, &[&str]) = match header_end {
        Some(idx) => (idx, &lines[idx + 1..]),
        None => (lines.len(), &[]),
    };

    let request_line = lines[0];
    let mut new_lines: Vec<String> = Vec::with_capacity(lines.len() + profile.custom_headers.len());
    new_lines.push(request_line.to_string());

    let mut has_ua = false;

    for line in &lines[1..header_lines_end] {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("user-agent:") && profile.rotate_ua {
            new_lines.push(format!("User-Agent: {}", random_user_agent()));
            has_ua = true;
        } else if lower.starts_with("host:") {
            if let Some(front) = &profile.front_domain {
                new_lines.push(format!("Host: {front}"));
            } else {
                new_lines.push((*line).to_string());
            }
        } else {
            new_lines.push((*line).to_string());
        }
    }

    if profile.rotate_ua && !has_ua {
        new_lines.push(format!("User-Agent: {}", random_user_agent()));
    }

    for (k, v) in &profile.custom_headers {
        new_lines.push(format!("{k}: {v}"));
    }

    let mut out = new_lines.join("\r\n").into_bytes();

    if header_end.is_some() {
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(body_lines.join("\r\n").as_bytes());
    }

    if profile.padding_size > 0 {
        let mut rng = rand::thread_rng();
        out.reserve(profile.padding_size as usize);
        for _ in 0..profile.padding_size {
            out.push(rng.gen_range(0..=255));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn profile() -> RewriteProfile {
        RewriteProfile::default()
    }

    #[test]
    fn identity_profile_is_idempotent_on_well_formed_input() {
        let input = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let once = modify(input, &profile());
        let twice = modify(&once, &profile());
        assert_eq!(once, twice);
        assert_eq!(once, input.to_vec());
    }

    #[test]
    fn custom_header_is_appended_before_blank_line() {
        let mut headers = HashMap::new();
        headers.insert("X-Test".to_string(), "Worked".to_string());
        let p = RewriteProfile {
            custom_headers: headers,
            ..RewriteProfile::default()
        };
        let input = b"GET http://httpbin.example/headers HTTP/1.1\r\nHost: httpbin.example\r\n\r\n";
        let out = modify(input, &p);
        let text = String::from_utf8(out).unwrap();
        let idx_header = text.find("X-Test: Worked").unwrap();
        let idx_blank = text.find("\r\n\r\n").unwrap();
        assert!(idx_header < idx_blank);
    }

    #[test]
    fn front_domain_replaces_host_header() {
        let p = RewriteProfile {
            front_domain: Some("cdn.example".to_string()),
            ..RewriteProfile::default()
        };
        let input = b"GET / HTTP/1.1\r\nHost: origin.example\r\n\r\n";
        let out = String::from_utf8(modify(input, &p)).unwrap();
        assert!(out.contains("Host: cdn.example"));
        assert!(!out.contains("origin.example"));
    }

    #[test]
    fn rotate_ua_replaces_existing_header() {
        let p = RewriteProfile {
            rotate_ua: true,
            ..RewriteProfile::default()
        };
        let input = b"GET / HTTP/1.1\r\nUser-Agent: curl/8.0\r\n\r\n";
        let out = String::from_utf8(modify(input, &p)).unwrap();
        assert!(!out.contains("curl/8.0"));
        assert!(USER_AGENTS.iter().any(|ua| out.contains(ua)));
    }

    #[test]
    fn rotate_ua_appends_when_absent() {
        let p = RewriteProfile {
            rotate_ua: true,
            ..RewriteProfile::default()
        };
        let input = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let out = String::from_utf8(modify(input, &p)).unwrap();
        assert!(out.contains("User-Agent:"));
    }

    #[test]
    fn padding_is_appended_after_body() {
        let p = RewriteProfile {
            padding_size: 16,
            ..RewriteProfile::default()
        };
        let input = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        let out = modify(input, &p);
        assert_eq!(out.len(), input.len() + 16);
        assert!(out.starts_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"));
    }

    #[test]
    fn invalid_utf8_passes_through_unchanged() {
        let input: &[u8] = &[0xff, 0xfe, 0x00, 0x01];
        assert_eq!(modify(input, &profile()), input.to_vec());
    }

    #[test]
    fn chunk_without_blank_line_is_treated_as_headers_only() {
        let input = b"GET / HTTP/1.1\r\nHost: x";
        let mut headers = HashMap::new();
        headers.insert("X-Test".to_string(), "1".to_string());
        let p = RewriteProfile {
            custom_headers: headers,
            ..RewriteProfile::default()
        };
        let out = String::from_utf8(modify(input, &p)).unwrap();
        assert!(out.contains("X-Test: 1"));
        assert!(!out.contains("\r\n\r\n"));
    }
}
