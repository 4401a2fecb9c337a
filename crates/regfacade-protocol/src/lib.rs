//! gRPC protocol types for the regfacade image spec service.
//!
//! This crate provides the tonic-generated client and server for the
//! `ImageSpecService` RPC the facade uses to resolve workspace names to
//! image composition specs.
//!
//! # Usage
//!
//! ```ignore
//! use regfacade_protocol::ImageSpecServiceClient;
//! use regfacade_protocol::v1::GetImageSpecRequest;
//!
//! let mut client = ImageSpecServiceClient::connect("http://spec-provider:9001").await?;
//! let response = client
//!     .get_image_spec(tonic::Request::new(GetImageSpecRequest {
//!         id: "acme/alice".to_string(),
//!     }))
//!     .await?;
//! ```

// Re-export tonic for convenience
pub use tonic;

/// Generated types for the `regfacade.v1` package.
pub mod v1 {
    tonic::include_proto!("regfacade.v1");
}

pub use v1::image_spec_service_client::ImageSpecServiceClient;
pub use v1::image_spec_service_server::{ImageSpecService, ImageSpecServiceServer};
pub use v1::{content_layer, ContentLayer, GetImageSpecRequest, GetImageSpecResponse, ImageSpec};
