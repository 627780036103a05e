//! dummybridge Web - Embedded login pages
//!
//! The pages a human uses to hand credentials to a waiting login flow:
//! code submission, cookie setting and local storage setting.

use rust_embed::Embed;

#[derive(Embed)]
#[folder = "pages/"]
pub struct Pages;
