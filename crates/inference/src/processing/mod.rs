pub mod letterbox;
pub mod post;
pub mod pre;
pub mod render;
