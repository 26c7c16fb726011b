pub mod firestore;
pub mod mqtt;
pub mod sqlite;

pub use firestore::FirestoreClient;
pub use mqtt::MqttAdapter;
pub use sqlite::SqliteRepository;
