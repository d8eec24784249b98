pub mod disk;
pub mod domain_xml;
pub mod network;
pub mod service;
pub mod template;
