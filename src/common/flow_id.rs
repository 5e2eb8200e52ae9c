/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use super::enums::FlowType;

/// Key of a tracked flow. Direction matters: the reverse direction of a
/// conversation is a distinct flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FlowId {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flow_type: FlowType,
}

impl FlowId {
    pub fn new(
        flow_type: FlowType,
        src: IpAddr,
        src_port: u16,
        dst: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
            flow_type,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            flow_type: self.flow_type,
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.src, self.dst) {
            (IpAddr::V6(_), _) | (_, IpAddr::V6(_)) => write!(
                f,
                "{} [{}]:{} -> [{}]:{}",
                self.flow_type, self.src, self.src_port, self.dst, self.dst_port
            ),
            _ => write!(
                f,
                "{} {}:{} -> {}:{}",
                self.flow_type, self.src, self.src_port, self.dst, self.dst_port
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    use super::*;

    fn id(flow_type: FlowType) -> FlowId {
        FlowId::new(
            flow_type,
            Ipv4Addr::new(10, 0, 0, 1).into(),
            40000,
            Ipv4Addr::new(10, 0, 0, 2).into(),
            80,
        )
    }

    #[test]
    fn direction_and_protocol_are_part_of_the_key() {
        let mut set = HashSet::new();
        set.insert(id(FlowType::Tcp));
        set.insert(id(FlowType::Tcp).reversed());
        set.insert(id(FlowType::Udp));
        set.insert(id(FlowType::Tcp));
        assert_eq!(set.len(), 3);
        assert_eq!(id(FlowType::Tcp).reversed().reversed(), id(FlowType::Tcp));
    }

    #[test]
    fn display() {
        assert_eq!(id(FlowType::Tcp).to_string(), "tcp 10.0.0.1:40000 -> 10.0.0.2:80");
        let v6 = FlowId::new(
            FlowType::Udp,
            "::1".parse().unwrap(),
            53,
            "fe80::1".parse().unwrap(),
            5353,
        );
        assert_eq!(v6.to_string(), "udp [::1]:53 -> [fe80::1]:5353");
    }
}
