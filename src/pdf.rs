use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::error::{RagError, Result};

/// Extracts the text of every page, in page order.
///
/// `pdf-extract` panics on some malformed fonts, so panics are caught and
/// reported as extraction errors.
pub fn extract_pages(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(RagError::MissingDocument(path.to_path_buf()));
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_by_pages(path)
    }));
    match outcome {
        Ok(Ok(pages)) => {
            tracing::debug!(path = %path.display(), pages = pages.len(), "extracted PDF text");
            Ok(pages)
        }
        Ok(Err(err)) => Err(RagError::Pdf {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
        Err(payload) => Err(RagError::Pdf {
            path: path.to_path_buf(),
            message: format!("extractor panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
