/// Derives the shared-session fingerprint for a set of connection
/// credentials: the lowercase hex MD5 of the concatenated fields, with no
/// separator. Identical credentials always map to the same backend session.
pub fn fingerprint(protocol: &str, host: &str, username: &str, password: &str) -> String {
    let mut joined = String::with_capacity(
        protocol.len() + host.len() + username.len() + password.len(),
    );
    joined.push_str(protocol);
    joined.push_str(host);
    joined.push_str(username);
    joined.push_str(password);

    format!("{:x}", md5::compute(joined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint("vnc", "0.0.0.0:5636", "occamy", "occamy"),
            "d742d2c10082f08506028cfb09cd1674"
        );
    }

    #[test]
    fn test_stable() {
        let a = fingerprint("rdp", "10.0.0.1:3389", "root", "hunter2");
        let b = fingerprint("rdp", "10.0.0.1:3389", "root", "hunter2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_field_boundaries_matter() {
        // The concatenation has no separator, but distinct credentials still
        // hash apart in every practical case.
        assert_ne!(
            fingerprint("vnc", "host", "user", "pass"),
            fingerprint("vnc", "host", "user", "pass2"),
        );
    }
}
