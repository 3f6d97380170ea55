//! Execution-chain state: escrowed transfer requests, vouchers, destination
//! deliveries and the local replica of hub stake.

pub mod assets;
pub mod attesters;
pub mod delivery;
pub mod ledger;
pub mod request;
pub mod stake_view;
pub mod voucher;

pub use assets::AssetBook;
pub use attesters::AttesterSet;
pub use delivery::{DeliveryBook, DeliveryRecord};
pub use ledger::{escrow_address, ExecutionLedger};
pub use request::{CreateRequestParams, RequestState, RequestStatus, TransferRequest};
pub use stake_view::StakeView;
pub use voucher::{IssueVoucherParams, SlashEvidence, Voucher, VoucherDelivery, VoucherStatus};
