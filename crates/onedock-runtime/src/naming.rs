//! Container name codec
//!
//! The container name is the only cross-restart storage for the
//! `(publicPort, dockerPort, replicaIndex)` triple, so encode and decode must
//! round-trip exactly. Format:
//! `{prefix}-{service}-p{publicPort}-c{dockerPort}-{replicaIndex}`.

use crate::error::{Result, RuntimeError};
use std::sync::LazyLock;

/// Suffix anchor applied after the prefix is stripped. The service segment is
/// greedy, which is safe because the `-p<n>-c<n>-<n>` tail is anchored at the
/// end of the name.
static NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^(.+)-p(\d+)-c(\d+)-(\d+)$").expect("valid pattern"));

/// Fields recovered from a managed container name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerName {
    pub service_name: String,
    pub public_port: u16,
    pub docker_port: u16,
    pub replica_index: u32,
}

/// Bidirectional codec between replica identity and container name
#[derive(Debug, Clone)]
pub struct NameCodec {
    prefix: String,
}

impl NameCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured container name prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Label key under the managed prefix, e.g. `onedock.service`
    pub fn label(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    /// Encode a replica identity into its container name
    pub fn encode(
        &self,
        service: &str,
        public_port: u16,
        docker_port: u16,
        replica_index: u32,
    ) -> String {
        format!(
            "{}-{}-p{}-c{}-{}",
            self.prefix, service, public_port, docker_port, replica_index
        )
    }

    /// Decode a container name back into its replica identity
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotManaged`] when the name does not start with
    /// the configured prefix, and [`RuntimeError::MalformedName`] when the
    /// remainder does not match the name grammar or a numeric segment is out
    /// of range.
    pub fn decode(&self, name: &str) -> Result<ContainerName> {
        let remainder = name
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| RuntimeError::NotManaged {
                name: name.to_string(),
            })?;

        let captures = NAME_RE
            .captures(remainder)
            .ok_or_else(|| RuntimeError::MalformedName {
                name: name.to_string(),
            })?;

        let malformed = || RuntimeError::MalformedName {
            name: name.to_string(),
        };

        // Ports are bounded by u16; the index by i32 per the name grammar.
        let public_port: u16 = captures[2].parse().map_err(|_| malformed())?;
        let docker_port: u16 = captures[3].parse().map_err(|_| malformed())?;
        let replica_index: u32 = captures[4]
            .parse()
            .ok()
            .filter(|idx| *idx <= i32::MAX as u32)
            .ok_or_else(malformed)?;

        Ok(ContainerName {
            service_name: captures[1].to_string(),
            public_port,
            docker_port,
            replica_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> NameCodec {
        NameCodec::new("onedock")
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(
            codec().encode("nginx-web", 9203, 30000, 0),
            "onedock-nginx-web-p9203-c30000-0"
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let codec = codec();
        let cases = [
            ("api", 9100u16, 30000u16, 0u32),
            ("nginx-web", 9203, 30002, 2),
            ("a-b-c.d_e", 1, 65535, 42),
        ];
        for (service, public, docker, index) in cases {
            let name = codec.encode(service, public, docker, index);
            let decoded = codec.decode(&name).unwrap();
            assert_eq!(decoded.service_name, service);
            assert_eq!(decoded.public_port, public);
            assert_eq!(decoded.docker_port, docker);
            assert_eq!(decoded.replica_index, index);
        }
    }

    #[test]
    fn test_decode_service_with_hyphens() {
        let decoded = codec().decode("onedock-my-api-v2-p8080-c30001-3").unwrap();
        assert_eq!(decoded.service_name, "my-api-v2");
        assert_eq!(decoded.replica_index, 3);
    }

    #[test]
    fn test_decode_rejects_foreign_prefix() {
        assert!(matches!(
            codec().decode("compose-web-p80-c30000-0"),
            Err(RuntimeError::NotManaged { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bare_prefix_match() {
        // "onedockX-..." must not be treated as managed
        assert!(matches!(
            codec().decode("onedockX-web-p80-c30000-0"),
            Err(RuntimeError::NotManaged { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_tail() {
        for name in [
            "onedock-web",
            "onedock-web-p80-c30000",
            "onedock-web-p80-30000-0",
            "onedock-web-pX-c30000-0",
        ] {
            assert!(
                matches!(codec().decode(name), Err(RuntimeError::MalformedName { .. })),
                "expected malformed: {name}"
            );
        }
    }

    #[test]
    fn test_decode_rejects_port_overflow() {
        assert!(matches!(
            codec().decode("onedock-web-p80-c99999-0"),
            Err(RuntimeError::MalformedName { .. })
        ));
    }

    #[test]
    fn test_label_key() {
        assert_eq!(codec().label("service"), "onedock.service");
    }
}
