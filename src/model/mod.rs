pub mod efficientnet;
pub mod features;
pub mod mbconv;
pub mod weights;
