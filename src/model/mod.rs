pub mod certificate;
pub mod host;

pub use certificate::{
    Certificate, CertificateId, CertificateMeta, CertificateProvider, CertificateUpdate,
    CertificateView,
};
pub use host::{Host, HostId, HostMeta, HostType, HostVariant};
