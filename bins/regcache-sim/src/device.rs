use rand::Rng;
use sip_regcache::{RegisterContext, Transport};

const USER_AGENT: &str = "regcache-sim/0.1";

/// A simulated phone behind NAT.
#[derive(Debug, Clone)]
pub struct Device {
    pub aor: String,
    pub user: String,
    /// Private address the device puts in its Contact.
    pub local_ip: String,
    pub local_port: u16,
    /// Address the server sees packets from.
    pub public_ip: String,
    pub public_port: u16,
}

impl Device {
    pub fn new<R: Rng>(index: usize, aors: usize, rng: &mut R) -> Self {
        let index = index as u32;
        Self {
            aor: format!("sip:user{}@example.com", index as usize % aors),
            user: format!("dev{}", index),
            local_ip: format!("10.{}.{}.{}", (index >> 16) & 0xff, (index >> 8) & 0xff, index & 0xff),
            local_port: 5060,
            public_ip: format!("203.0.113.{}", index % 254 + 1),
            public_port: rng.gen_range(1024..=65535),
        }
    }

    pub fn contact(&self) -> String {
        format!("sip:{}@{}:{}", self.user, self.local_ip, self.local_port)
    }

    /// The NAT picked a new public port.
    pub fn rebind<R: Rng>(&mut self, rng: &mut R) {
        self.public_port = rng.gen_range(1024..=65535);
    }

    pub fn register(&self, expires: u32) -> sip_regcache::Result<RegisterContext> {
        RegisterContext::builder(format!("<{}>", self.aor))
            .contact(format!("<{}>;expires={}", self.contact(), expires))
            .source(self.public_ip.as_str(), self.public_port)
            .transport(Transport::Udp)
            .user_agent(USER_AGENT)
            .build()
    }
}
