//! Export of aligned frames as per-day NumPy matrices.

mod exporter;
pub mod npy;

pub use exporter::{
    default_field_mapping, ExportOptions, ExportReport, MetricsSelection, NumpyExporter,
};
