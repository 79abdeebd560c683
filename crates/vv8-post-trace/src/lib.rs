pub mod html;
pub mod record;
pub mod scan;
pub mod split;

pub use crate::record::{filter_name, ApiAccess, RecordOp};
pub use crate::scan::{LineScanner, SegmentReader};
pub use crate::split::{split_fields, SplitError};
