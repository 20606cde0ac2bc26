use serde::{Deserialize, Serialize};

/// What the server advertised for resumable uploads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TusSupport {
    pub version: String,
    pub extensions: Vec<String>,
    /// Largest PATCH body the server accepts.
    pub max_chunk_size: Option<u64>,
    /// Largest whole upload the server accepts (`Tus-Max-Size`).
    pub max_size: Option<u64>,
    /// Send PATCH as POST with `X-HTTP-Method-Override`.
    pub http_method_override: bool,
}

impl TusSupport {
    /// Build a descriptor from the raw `Tus-Version`, `Tus-Extension` and
    /// `Tus-Max-Size` header values of an OPTIONS response.
    pub fn from_headers(
        version: Option<&str>,
        extension: Option<&str>,
        max_size: Option<&str>,
    ) -> Option<Self> {
        let version = version?
            .split(',')
            .map(str::trim)
            .find(|v| !v.is_empty())?
            .to_string();
        let extensions = extension
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self {
            version,
            extensions,
            max_chunk_size: None,
            max_size: max_size.and_then(|m| m.trim().parse().ok()),
            http_method_override: false,
        })
    }

    /// Fold in `Tus-Max-Chunk-Size` and the `Allow` method list of the same
    /// OPTIONS response. A server whose `Allow` list omits PATCH takes chunks
    /// as POST with a method override.
    pub fn with_transport_hints(mut self, max_chunk_size: Option<&str>, allow: Option<&str>) -> Self {
        self.max_chunk_size = max_chunk_size
            .and_then(|m| m.trim().parse().ok())
            .filter(|m: &u64| *m > 0);
        self.http_method_override = allow.is_some_and(|methods| {
            !methods
                .split(',')
                .any(|m| m.trim().eq_ignore_ascii_case("PATCH"))
        });
        self
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(name))
    }

    pub fn creation_with_upload(&self) -> bool {
        self.has_extension("creation-with-upload")
    }

    pub fn termination(&self) -> bool {
        self.has_extension("termination")
    }

    pub fn checksum(&self) -> bool {
        self.has_extension("checksum")
    }
}

/// Capability flags consumed by the strategy selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerCapabilities {
    pub chunking: bool,
    pub tus: Option<TusSupport>,
}
