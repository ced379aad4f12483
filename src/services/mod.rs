pub mod calendar;
pub mod catalog;
pub mod ledger;
pub mod lifecycle;
pub mod notifications;
pub mod payment;
pub mod reconciliation;
pub mod release;
pub mod store;
pub mod webhook;
