//! PDF handling: upload inspection and page rasterization.

mod inspect;
mod rasterize;

pub use inspect::{inspect, DocumentInfo};
pub use rasterize::PdftoppmRasterizer;

#[cfg(test)]
pub(crate) use inspect::tests::sample_pdf;
