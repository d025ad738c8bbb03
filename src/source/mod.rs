// Where repository content comes from. The live tree/blob API, a bulk zip
// download or an uploaded archive all answer the same `Source` trait.

pub mod github_api;
pub mod github_download;
pub mod github_stream;
pub mod repository;
pub mod traits;
pub mod zip_source;
