use std::fmt::Write;

use orbit_core::model::{EndpointSection, HAProxyConfiguration, HAProxyEndpoint, IntegrityError};

/// Renders the complete config file. Endpoints come out in name order, so
/// equal inputs always render byte-equal output.
pub fn render(config: &HAProxyConfiguration) -> Result<String, IntegrityError> {
    config.validate()?;

    let mut out = String::with_capacity(config.global_section.len() + 256 * config.endpoints.len());
    out.push_str(&config.global_section);
    out.push('\n');
    for endpoint in config.endpoints.values() {
        render_endpoint(&mut out, endpoint);
    }
    Ok(out)
}

fn render_endpoint(out: &mut String, endpoint: &HAProxyEndpoint) {
    // writing into a String cannot fail
    let _ = match &endpoint.section {
        EndpointSection::Listen { address, .. } => {
            writeln!(out, "listen {} {}", endpoint.name, address)
        }
        EndpointSection::Backend { .. } => writeln!(out, "backend {}", endpoint.name),
    };

    for line in endpoint.section.config().lines() {
        let line = line.trim();
        if !line.is_empty() {
            let _ = writeln!(out, "\t{}", line);
        }
    }

    for address in endpoint.backend_servers.keys() {
        let _ = write!(out, "\tserver {} {}", endpoint.server_name(address), address);
        if !endpoint.per_server.is_empty() {
            let _ = write!(out, " {}", endpoint.per_server.trim());
        }
        out.push('\n');
    }
    out.push('\n');
}
