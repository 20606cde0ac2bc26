pub struct RemotePath;

impl RemotePath {
    /// Standardize a remote path: forward slashes, one leading slash, no
    /// duplicate or trailing separators.
    pub fn normalize(path: &str) -> String {
        let replaced = path.replace('\\', "/");
        let segments: Vec<&str> = replaced
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        format!("/{}", segments.join("/"))
    }

    /// Reject traversal segments; the server root must never be escaped.
    pub fn verify_safe(path: &str) -> bool {
        !path.replace('\\', "/").split('/').any(|s| s == "..")
    }

    pub fn segments(path: &str) -> Vec<String> {
        Self::normalize(path)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Parent collection of a normalized path. The root is its own parent.
    pub fn parent(path: &str) -> String {
        let normalized = Self::normalize(path);
        match normalized.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => normalized[..idx].to_string(),
        }
    }

    pub fn file_name(path: &str) -> Option<String> {
        Self::segments(path).pop()
    }

    /// Name used when the server copy of a conflicted file is kept next to
    /// the local one: `report.pdf` -> `report (conflicted copy 2024-05-01 101500).pdf`.
    pub fn conflicted_copy_name(file_name: &str, stamp: &str) -> String {
        match file_name.rfind('.') {
            Some(idx) if idx > 0 => format!(
                "{} (conflicted copy {stamp}){}",
                &file_name[..idx],
                &file_name[idx..]
            ),
            _ => format!("{file_name} (conflicted copy {stamp})"),
        }
    }
}
