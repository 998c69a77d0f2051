//! Port allocation for the emulator's three listeners.

use std::net::TcpListener;

use getset::CopyGetters;
pub use portpicker::Port;

use crate::error::LaunchError;

/// Ports the emulator binds: admin, client-API (REST) and peer (gRPC).
#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct EmulatorPorts {
    /// Admin port
    admin: Port,
    /// REST / client-API port, probed for readiness
    rest: Port,
    /// gRPC / peer port
    grpc: Port,
}

impl EmulatorPorts {
    /// Creates a port set from explicit values.
    pub fn new(admin: Port, rest: Port, grpc: Port) -> Self {
        Self { admin, rest, grpc }
    }
}

/// Optional fixed ports. Any port left as `None` is reserved from the OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortOverrides {
    /// Admin port
    pub admin: Option<Port>,
    /// REST port
    pub rest: Option<Port>,
    /// gRPC port
    pub grpc: Option<Port>,
}

/// Reserves `count` distinct ports that are currently free on 127.0.0.1.
///
/// Each port is obtained by binding port 0 and reading back the OS assignment.
/// Listeners are held until the batch is complete so no port repeats, then all are released.
/// Nothing stops another process from taking a port between release and use.
pub fn reserve_ports(count: usize) -> Result<Vec<Port>, LaunchError> {
    reserve_ports_excluding(count, &[])
}

fn reserve_ports_excluding(count: usize, exclude: &[Port]) -> Result<Vec<Port>, LaunchError> {
    // skipped listeners stay bound so the OS cannot hand the same port back
    let mut held = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    while ports.len() < count {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|source| LaunchError::Allocation { count, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| LaunchError::Allocation { count, source })?
            .port();
        if !exclude.contains(&port) {
            ports.push(port);
        }
        held.push(listener);
    }

    Ok(ports)
}

/// Checks `fixed_port` is not in use.
/// If `fixed_port` is `None`, returns a port reserved from the OS.
pub fn pick_unused_port(fixed_port: Option<Port>) -> Result<Port, LaunchError> {
    match fixed_port {
        Some(port) if !portpicker::is_free(port) => Err(LaunchError::PortInUse { port }),
        Some(port) => Ok(port),
        None => reserve_ports(1)?
            .pop()
            .ok_or_else(|| LaunchError::Allocation {
                count: 1,
                source: std::io::Error::other("no port returned"),
            }),
    }
}

/// Resolves all three emulator ports, reserving every port without an override in one batch.
pub fn resolve_ports(overrides: &PortOverrides) -> Result<EmulatorPorts, LaunchError> {
    let fixed = [overrides.admin, overrides.rest, overrides.grpc];
    for port in fixed.iter().flatten() {
        if !portpicker::is_free(*port) {
            return Err(LaunchError::PortInUse { port: *port });
        }
    }

    let missing = fixed.iter().filter(|port| port.is_none()).count();
    let fixed_ports: Vec<Port> = fixed.iter().flatten().copied().collect();
    let mut reserved = reserve_ports_excluding(missing, &fixed_ports)?.into_iter();
    let mut next = |fixed: Option<Port>| -> Result<Port, LaunchError> {
        match fixed {
            Some(port) => Ok(port),
            None => reserved.next().ok_or_else(|| LaunchError::Allocation {
                count: missing,
                source: std::io::Error::other("reserved fewer ports than requested"),
            }),
        }
    };

    Ok(EmulatorPorts {
        admin: next(overrides.admin)?,
        rest: next(overrides.rest)?,
        grpc: next(overrides.grpc)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn reserve_three_distinct_bindable() {
        let ports = reserve_ports(3).unwrap();
        assert_eq!(ports.len(), 3);

        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 3);

        for port in ports {
            TcpListener::bind(("127.0.0.1", port)).unwrap();
        }
    }

    #[test]
    fn reserve_zero() {
        assert!(reserve_ports(0).unwrap().is_empty());
    }

    #[test]
    fn fixed_port_in_use() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(matches!(
            pick_unused_port(Some(port)),
            Err(LaunchError::PortInUse { port: p }) if p == port
        ));
    }

    #[test]
    fn overrides_are_kept() {
        let free = reserve_ports(1).unwrap()[0];
        let ports = resolve_ports(&PortOverrides {
            rest: Some(free),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(ports.rest(), free);
        assert_ne!(ports.admin(), ports.grpc());
        assert_ne!(ports.admin(), free);
        assert_ne!(ports.grpc(), free);
    }

    #[test]
    fn busy_override_rejected() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = resolve_ports(&PortOverrides {
            admin: Some(port),
            ..Default::default()
        });
        assert!(matches!(result, Err(LaunchError::PortInUse { .. })));
    }
}
