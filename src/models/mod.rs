pub mod booking;
pub mod class_session;
pub mod ids;
pub mod money;

pub use booking::{Booking, BookingStatus, Participant, PaymentStatus, Pricing, UnknownState};
pub use class_session::ClassSession;
pub use ids::{BookerId, BookingId, ClassId};
pub use money::Money;
