//! Repository layer: one zero-sized struct per table with async associated
//! functions that take a `&PgPool`.

pub mod batch_repo;
pub mod item_repo;
pub mod result_asset_repo;

pub use batch_repo::BatchRepo;
pub use item_repo::ItemRepo;
pub use result_asset_repo::ResultAssetRepo;
