use guid_create::GUID;

pub type TransactionId = String;

pub fn gen_tid() -> TransactionId {
    GUID::rand().to_string().to_lowercase().replace('-', "")
}

lazy_static::lazy_static! {
  pub static ref STARTUP_TID: TransactionId = "Startup".to_string();
  pub static ref TEST_TID: TransactionId = "TestTest".to_string();
  pub static ref SAMPLER_TID: TransactionId = "Sampler".to_string();
  pub static ref COORDINATOR_TID: TransactionId = "Coordinator".to_string();
  pub static ref COMM_TID: TransactionId = "Comm".to_string();
  pub static ref STORAGE_TID: TransactionId = "Storage".to_string();
  pub static ref CATALOG_TID: TransactionId = "SensorCatalog".to_string();
  pub static ref INTERRUPT_TID: TransactionId = "Interrupt".to_string();
}
