use crate::error::InputError;

/// What we learn about an upload before accepting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub page_count: usize,
}

/// Check that `bytes` is a PDF we can work with.
pub fn inspect(bytes: &[u8]) -> Result<DocumentInfo, InputError> {
    if bytes.is_empty() {
        return Err(InputError::Empty);
    }
    let doc =
        lopdf::Document::load_mem(bytes).map_err(|e| InputError::Undecodable(e.to_string()))?;

    let page_count = doc.get_pages().len();
    if page_count == 0 {
        return Err(InputError::NoPages);
    }

    tracing::debug!(page_count, bytes = bytes.len(), "Inspected PDF");
    Ok(DocumentInfo { page_count })
}

/// Page count of a PDF on disk.
pub(crate) fn page_count(path: &std::path::Path) -> Result<usize, InputError> {
    let bytes = std::fs::read(path).map_err(|e| InputError::Undecodable(e.to_string()))?;
    inspect(&bytes).map(|info| info.page_count)
}
