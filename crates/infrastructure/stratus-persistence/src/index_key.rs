pub const INDEX_KEY_SEPARATOR: u8 = 0;

/// Composite `owner \0 item` key used by the account index and the file
/// state table. Scanning everything an owner holds is a range over
/// [`IndexKey::range_for_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexKey<'a> {
    pub owner: &'a str,
    pub item: &'a str,
}

impl<'a> IndexKey<'a> {
    pub fn new(owner: &'a str, item: &'a str) -> Self {
        Self { owner, item }
    }

    pub fn validate_owner(owner: &str) -> Result<(), crate::StorageError> {
        if owner.is_empty() || owner.as_bytes().contains(&INDEX_KEY_SEPARATOR) {
            return Err(crate::StorageError::InvalidPath(owner.to_string()));
        }
        Ok(())
    }

    pub fn prefix_for_owner(owner: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(owner.len() + 1);
        prefix.extend_from_slice(owner.as_bytes());
        prefix.push(INDEX_KEY_SEPARATOR);
        prefix
    }

    /// Half-open byte range covering every key of `owner`.
    pub fn range_for_owner(owner: &str) -> Result<(Vec<u8>, Vec<u8>), crate::StorageError> {
        Self::validate_owner(owner)?;
        let start = Self::prefix_for_owner(owner);
        let mut end = start.clone();
        if let Some(last) = end.last_mut() {
            *last = INDEX_KEY_SEPARATOR + 1;
        }
        Ok((start, end))
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.owner.len() + 1 + self.item.len());
        key.extend_from_slice(self.owner.as_bytes());
        key.push(INDEX_KEY_SEPARATOR);
        key.extend_from_slice(self.item.as_bytes());
        key
    }

    pub fn item_from_prefixed_key<'k>(prefix: &[u8], full_key: &'k [u8]) -> Option<&'k str> {
        let rest = full_key.strip_prefix(prefix)?;
        std::str::from_utf8(rest).ok()
    }
}
