pub mod diagnostics;
pub mod doc_lock;
pub mod health;

pub use diagnostics::*;
pub use doc_lock::*;
pub use health::*;
