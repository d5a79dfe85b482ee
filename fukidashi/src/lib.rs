pub mod app;
pub mod loader;
pub mod ocr;
