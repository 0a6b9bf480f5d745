pub mod clone;
pub mod complexity;
pub mod intake;
pub mod security;

pub use clone::CloneStage;
pub use complexity::ComplexityScanStage;
pub use intake::IntakeStage;
pub use security::SecurityScanStage;
