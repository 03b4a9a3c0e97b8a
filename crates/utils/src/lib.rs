mod build_info;
pub mod link;
pub mod logging;
pub mod netns;
pub mod version;
