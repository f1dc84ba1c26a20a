pub mod paymob;
pub mod stripe;
