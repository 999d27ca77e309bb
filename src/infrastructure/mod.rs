pub mod kis_client;
