//! Wire types and service glue for the CNI plugin protocol
//!
//! The message and service definitions are maintained by hand so builds do
//! not require protoc; the shapes follow the prost/tonic code generator
//! output for the `rpc.PodNetworkBackend` service.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct AllocIpRequest {
    #[prost(string, tag = "1")]
    pub k8s_pod_name: String,
    #[prost(string, tag = "2")]
    pub k8s_pod_namespace: String,
    /// Sandbox container id of the pod being set up.
    #[prost(string, tag = "3")]
    pub k8s_pod_infra_container_id: String,
    #[prost(string, tag = "4")]
    pub netns: String,
    #[prost(string, tag = "5")]
    pub if_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AllocIpReply {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(enumeration = "IpType", tag = "2")]
    pub ip_type: i32,
    #[prost(bool, tag = "3")]
    pub ipv4: bool,
    #[prost(bool, tag = "4")]
    pub ipv6: bool,
    #[prost(message, repeated, tag = "5")]
    pub net_confs: Vec<NetConf>,
    #[prost(bool, tag = "6")]
    pub enable_trunking: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReleaseIpRequest {
    #[prost(string, tag = "1")]
    pub k8s_pod_name: String,
    #[prost(string, tag = "2")]
    pub k8s_pod_namespace: String,
    #[prost(string, tag = "3")]
    pub k8s_pod_infra_container_id: String,
    #[prost(string, tag = "4")]
    pub reason: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReleaseIpReply {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(bool, tag = "2")]
    pub ipv4: bool,
    #[prost(bool, tag = "3")]
    pub ipv6: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetInfoRequest {
    #[prost(string, tag = "1")]
    pub k8s_pod_name: String,
    #[prost(string, tag = "2")]
    pub k8s_pod_namespace: String,
    #[prost(string, tag = "3")]
    pub k8s_pod_infra_container_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetInfoReply {
    #[prost(enumeration = "IpType", tag = "1")]
    pub ip_type: i32,
    #[prost(bool, tag = "2")]
    pub ipv4: bool,
    #[prost(bool, tag = "3")]
    pub ipv6: bool,
    #[prost(message, repeated, tag = "4")]
    pub net_confs: Vec<NetConf>,
    #[prost(bool, tag = "5")]
    pub enable_trunking: bool,
    #[prost(enumeration = "ErrorCode", tag = "6")]
    pub error: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct EventRequest {
    #[prost(enumeration = "EventType", tag = "1")]
    pub event_type: i32,
    #[prost(enumeration = "EventTarget", tag = "2")]
    pub event_target: i32,
    #[prost(string, tag = "3")]
    pub k8s_pod_name: String,
    #[prost(string, tag = "4")]
    pub k8s_pod_namespace: String,
    #[prost(string, tag = "5")]
    pub reason: String,
    #[prost(string, tag = "6")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct EventReply {
    #[prost(bool, tag = "1")]
    pub succeed: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// One interface the plugin must wire into the pod.
#[derive(Clone, PartialEq, Message)]
pub struct NetConf {
    #[prost(message, optional, tag = "1")]
    pub basic_info: Option<BasicInfo>,
    #[prost(message, optional, tag = "2")]
    pub eni_info: Option<EniInfo>,
    #[prost(message, optional, tag = "3")]
    pub pod: Option<Pod>,
    /// Interface name inside the pod; empty means the default interface.
    #[prost(string, tag = "4")]
    pub if_name: String,
    #[prost(message, repeated, tag = "5")]
    pub extra_routes: Vec<Route>,
    #[prost(bool, tag = "6")]
    pub default_route: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct BasicInfo {
    #[prost(message, optional, tag = "1")]
    pub pod_ip: Option<IpSet>,
    #[prost(message, optional, tag = "2")]
    pub pod_cidr: Option<IpSet>,
    #[prost(message, optional, tag = "3")]
    pub gateway_ip: Option<IpSet>,
    #[prost(message, optional, tag = "4")]
    pub service_cidr: Option<IpSet>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EniInfo {
    #[prost(string, tag = "1")]
    pub mac: String,
    #[prost(bool, tag = "2")]
    pub trunk: bool,
    /// VLAN id of the trunk member interface; zero when not trunked.
    #[prost(uint32, tag = "3")]
    pub vid: u32,
    #[prost(message, optional, tag = "4")]
    pub gateway_ip: Option<IpSet>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Pod {
    #[prost(uint64, tag = "1")]
    pub ingress: u64,
    #[prost(uint64, tag = "2")]
    pub egress: u64,
    #[prost(string, tag = "3")]
    pub network_priority: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Route {
    #[prost(string, tag = "1")]
    pub dst: String,
}

/// Address pair in string form; either side may be empty.
#[derive(Clone, PartialEq, Message)]
pub struct IpSet {
    #[prost(string, tag = "1")]
    pub ipv4: String,
    #[prost(string, tag = "2")]
    pub ipv6: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IpType {
    TypeVpcIp = 0,
    TypeVpcEni = 1,
    TypeEniMultiIp = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    ErrNone = 0,
    ErrCrdNotFound = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    EventTypeNormal = 0,
    EventTypeWarning = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventTarget {
    EventTargetNode = 0,
    EventTargetPod = 1,
}

pub mod pod_network_backend_server {
    use super::*;
    use tonic::codegen::*;

    /// Service trait the daemon's coordinator implements.
    #[async_trait]
    pub trait PodNetworkBackend: Send + Sync + 'static {
        async fn alloc_ip(
            &self,
            request: tonic::Request<AllocIpRequest>,
        ) -> std::result::Result<tonic::Response<AllocIpReply>, tonic::Status>;

        async fn release_ip(
            &self,
            request: tonic::Request<ReleaseIpRequest>,
        ) -> std::result::Result<tonic::Response<ReleaseIpReply>, tonic::Status>;

        async fn get_ip_info(
            &self,
            request: tonic::Request<GetInfoRequest>,
        ) -> std::result::Result<tonic::Response<GetInfoReply>, tonic::Status>;

        async fn record_event(
            &self,
            request: tonic::Request<EventRequest>,
        ) -> std::result::Result<tonic::Response<EventReply>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct PodNetworkBackendServer<T> {
        inner: Arc<T>,
    }

    impl<T> PodNetworkBackendServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T> Clone for PodNetworkBackendServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for PodNetworkBackendServer<T>
    where
        T: PodNetworkBackend,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/rpc.PodNetworkBackend/AllocIP" => {
                    struct AllocIpSvc<T>(Arc<T>);
                    impl<T: PodNetworkBackend> tonic::server::UnaryService<AllocIpRequest> for AllocIpSvc<T> {
                        type Response = AllocIpReply;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<AllocIpRequest>) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.alloc_ip(request).await })
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    Box::pin(async move {
                        let method = AllocIpSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                "/rpc.PodNetworkBackend/ReleaseIP" => {
                    struct ReleaseIpSvc<T>(Arc<T>);
                    impl<T: PodNetworkBackend> tonic::server::UnaryService<ReleaseIpRequest> for ReleaseIpSvc<T> {
                        type Response = ReleaseIpReply;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<ReleaseIpRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.release_ip(request).await })
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    Box::pin(async move {
                        let method = ReleaseIpSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                "/rpc.PodNetworkBackend/GetIPInfo" => {
                    struct GetIpInfoSvc<T>(Arc<T>);
                    impl<T: PodNetworkBackend> tonic::server::UnaryService<GetInfoRequest> for GetIpInfoSvc<T> {
                        type Response = GetInfoReply;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<GetInfoRequest>) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.get_ip_info(request).await })
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    Box::pin(async move {
                        let method = GetIpInfoSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                "/rpc.PodNetworkBackend/RecordEvent" => {
                    struct RecordEventSvc<T>(Arc<T>);
                    impl<T: PodNetworkBackend> tonic::server::UnaryService<EventRequest> for RecordEventSvc<T> {
                        type Response = EventReply;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(&mut self, request: tonic::Request<EventRequest>) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.record_event(request).await })
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    Box::pin(async move {
                        let method = RecordEventSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", tonic::Code::Unimplemented as i32)
                        .header(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE)
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T> tonic::server::NamedService for PodNetworkBackendServer<T> {
        const NAME: &'static str = "rpc.PodNetworkBackend";
    }
}

pub mod pod_network_backend_client {
    use super::*;
    use tonic::codegen::*;

    /// Client used by the CNI plugin and by in-process tests.
    #[derive(Debug, Clone)]
    pub struct PodNetworkBackendClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl PodNetworkBackendClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> PodNetworkBackendClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub async fn alloc_ip(
            &mut self,
            request: impl tonic::IntoRequest<AllocIpRequest>,
        ) -> std::result::Result<tonic::Response<AllocIpReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/rpc.PodNetworkBackend/AllocIP");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("rpc.PodNetworkBackend", "AllocIP"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn release_ip(
            &mut self,
            request: impl tonic::IntoRequest<ReleaseIpRequest>,
        ) -> std::result::Result<tonic::Response<ReleaseIpReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/rpc.PodNetworkBackend/ReleaseIP");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("rpc.PodNetworkBackend", "ReleaseIP"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn get_ip_info(
            &mut self,
            request: impl tonic::IntoRequest<GetInfoRequest>,
        ) -> std::result::Result<tonic::Response<GetInfoReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/rpc.PodNetworkBackend/GetIPInfo");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("rpc.PodNetworkBackend", "GetIPInfo"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn record_event(
            &mut self,
            request: impl tonic::IntoRequest<EventRequest>,
        ) -> std::result::Result<tonic::Response<EventReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/rpc.PodNetworkBackend/RecordEvent");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("rpc.PodNetworkBackend", "RecordEvent"));
            self.inner.unary(req, path, codec).await
        }
    }
}

pub use pod_network_backend_client::PodNetworkBackendClient;
pub use pod_network_backend_server::{PodNetworkBackend, PodNetworkBackendServer};
