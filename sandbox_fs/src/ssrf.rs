// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::IpAddr;

use url::{Host, Url};

use crate::FsError;

///
/// Refuse URLs that would make the gateway fetch from itself or from the
/// internal network: loopback, link-local, RFC1918, unspecified, and their
/// IPv6 equivalents. Hostnames are resolved first, and every resolved address
/// must pass, so a DNS name pointing at 127.0.0.1 is rejected just like the
/// literal.
///
/// Error messages never echo the URL: presigned URLs embed credentials.
///
pub async fn guard_url(url: &str) -> Result<(), FsError> {
    let parsed =
        Url::parse(url).map_err(|e| FsError::Security(format!("Invalid transfer URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => (),
        scheme => {
            return Err(FsError::Security(format!(
                "Refusing transfer over scheme `{scheme}`"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| FsError::Security("Transfer URL has no host".to_owned()))?;

    match host {
        Host::Ipv4(ip) => check_addr(IpAddr::V4(ip)),
        Host::Ipv6(ip) => check_addr(IpAddr::V6(ip)),
        Host::Domain(domain) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            let addrs = tokio::net::lookup_host((domain, port)).await.map_err(|e| {
                FsError::Security(format!("Could not resolve transfer host: {e}"))
            })?;
            let mut resolved_any = false;
            for addr in addrs {
                resolved_any = true;
                check_addr(addr.ip())?;
            }
            if !resolved_any {
                return Err(FsError::Security(
                    "Transfer host resolved to no addresses".to_owned(),
                ));
            }
            Ok(())
        }
    }
}

fn check_addr(ip: IpAddr) -> Result<(), FsError> {
    if is_disallowed_ip(ip) {
        Err(FsError::Security(
            "Transfer host resolves to a disallowed address".to_owned(),
        ))
    } else {
        Ok(())
    }
}

/// The address classes a presigned URL must never point at.
pub(crate) fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local unicast.
                || (segments[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique local.
                || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::{guard_url, is_disallowed_ip};
    use crate::FsError;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_internal_address_classes() {
        for addr in [
            "127.0.0.1",
            "127.8.8.8",
            "10.0.0.5",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "255.255.255.255",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "fc00::2",
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_disallowed_ip(ip(addr)), "{addr} should be disallowed");
        }
    }

    #[test]
    fn allows_public_addresses() {
        for addr in ["8.8.8.8", "93.184.216.34", "172.32.0.1", "2606:4700::1111"] {
            assert!(!is_disallowed_ip(ip(addr)), "{addr} should be allowed");
        }
    }

    #[tokio::test]
    async fn rejects_loopback_literal_url() {
        let err = guard_url("http://127.0.0.1:9000/bucket/key?sig=abc")
            .await
            .expect_err("expected refusal");
        assert!(matches!(err, FsError::Security(_)));
        // The signed URL must not leak into the error text.
        assert!(!err.to_string().contains("sig=abc"));
    }

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        let err = guard_url("file:///etc/passwd").await.expect_err("expected refusal");
        assert!(matches!(err, FsError::Security(_)));
    }

    #[tokio::test]
    async fn localhost_name_resolves_to_loopback_and_is_rejected() {
        let err = guard_url("http://localhost:9000/key")
            .await
            .expect_err("expected refusal");
        assert!(matches!(err, FsError::Security(_)));
    }
}
