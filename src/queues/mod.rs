//! Work queues and the OCR orchestrator built on them.

pub mod ocr;
pub mod work;
