//! Resource-reservations wire types
//!
//! Hand-maintained prost messages and tonic client for the kubelet's
//! resource-reservations endpoint. The service is small enough that keeping
//! the generated shape in-tree beats requiring protoc at build time.

pub mod reservations {
    pub mod v1 {
        use prost::Message;
        use std::collections::HashMap;

        #[derive(Clone, PartialEq, Message)]
        pub struct GetResourceReservationsRequest {}

        #[derive(Clone, PartialEq, Message)]
        pub struct GetResourceReservationsResponse {
            /// Resource name -> quantity string, e.g. "memory" -> "2Gi".
            #[prost(map = "string, string", tag = "1")]
            pub system_reserved: HashMap<String, String>,
            #[prost(map = "string, string", tag = "2")]
            pub kube_reserved: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct UpdateResourceReservationsRequest {
            #[prost(map = "string, string", tag = "1")]
            pub kube_reserved: HashMap<String, String>,
            #[prost(map = "string, string", tag = "2")]
            pub system_reserved: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct UpdateResourceReservationsResponse {}

        pub mod resource_reservations_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct ResourceReservationsClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl ResourceReservationsClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> ResourceReservationsClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub async fn get_resource_reservations(
                    &mut self,
                    request: impl tonic::IntoRequest<GetResourceReservationsRequest>,
                ) -> Result<tonic::Response<GetResourceReservationsResponse>, tonic::Status>
                {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/reservations.v1.ResourceReservations/GetResourceReservations",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn update_resource_reservations(
                    &mut self,
                    request: impl tonic::IntoRequest<UpdateResourceReservationsRequest>,
                ) -> Result<tonic::Response<UpdateResourceReservationsResponse>, tonic::Status>
                {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/reservations.v1.ResourceReservations/UpdateResourceReservations",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use reservations::v1::resource_reservations_client::ResourceReservationsClient;
pub use reservations::v1::*;
