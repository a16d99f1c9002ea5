//! Campaign orchestration — lifecycle control, recipient import, and
//! metrics aggregation over the delivery and conversation engines.

pub mod lifecycle;

pub use lifecycle::CampaignLifecycleController;
