//! Connection URI helpers.

/// URI actually handed to the transport.
///
/// Remote-shell transports must never stop on an interactive password
/// prompt, so `no_tty=1` is appended to SSH URIs that do not set it.
pub fn transport_uri(uri: &str) -> String {
    if is_ssh(uri) && !uri.contains("no_tty=") {
        let sep = if uri.contains('?') { '&' } else { '?' };
        format!("{}{}no_tty=1", uri, sep)
    } else {
        uri.to_string()
    }
}

/// Whether the URI goes through a remote shell tunnel.
pub fn is_ssh(uri: &str) -> bool {
    uri.split("://")
        .next()
        .map(|scheme| scheme.to_lowercase().contains("ssh"))
        .unwrap_or(false)
}

/// Short host name for display, e.g. `qemu+ssh://root@node2:22/system`
/// becomes `node2`. Local URIs map to `Local`.
pub fn server_name(uri: &str) -> String {
    if uri.is_empty() {
        return "Unknown".to_string();
    }

    let rest = match uri.split_once("://") {
        Some((_, rest)) => rest,
        None => return uri.to_string(),
    };

    let authority = rest.split(|c: char| c == '/' || c == '?').next().unwrap_or("");
    let host_port = authority.rsplit('@').next().unwrap_or("");
    let host = match host_port.strip_prefix('[') {
        // IPv6 literal
        Some(v6) => v6.split(']').next().unwrap_or(""),
        None => host_port.split(':').next().unwrap_or(""),
    };

    if host.is_empty() {
        "Local".to_string()
    } else {
        host.to_string()
    }
}
