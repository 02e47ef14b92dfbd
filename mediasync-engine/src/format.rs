//! Format descriptors and capability negotiation
//!
//! A [`FormatDescriptor`] is an ordered property list (media type, subtype,
//! then per-media properties). Each property is a [`Choice`]: a fixed value,
//! a bounded range, a stepped range or an enumerated set. The same type is
//! used to advertise capabilities and to request a concrete format; a
//! concrete [`Format`] is a descriptor whose properties are all fixed.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
}

/// Media subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaSubtype {
    /// Uncompressed samples/pixels
    Raw,
}

/// Interleaved sample encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    S16LE,
    S16BE,
    S24LE,
    S32LE,
    F32LE,
}

impl SampleFormat {
    /// Bytes per sample of one channel
    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            SampleFormat::S16LE | SampleFormat::S16BE => 2,
            SampleFormat::S24LE => 3,
            SampleFormat::S32LE | SampleFormat::F32LE => 4,
        }
    }
}

/// Pixel formats for raw video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Nv12,
    I420,
    Rgb24,
    Bgra,
}

/// Frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(width: u32, height: u32) -> Self {
        Rectangle { width, height }
    }
}

/// Frame rate
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

impl Fraction {
    pub fn new(num: u32, denom: u32) -> Self {
        Fraction { num, denom }
    }

    fn cmp_value(&self, other: &Fraction) -> std::cmp::Ordering {
        (self.num as u64 * other.denom as u64).cmp(&(other.num as u64 * self.denom as u64))
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_value(other) == std::cmp::Ordering::Equal
    }
}

/// Value types that can appear inside a [`Choice`]
pub trait ChoiceValue: Clone + PartialEq + fmt::Debug {
    /// `min <= self <= max`
    fn within(&self, min: &Self, max: &Self) -> bool;

    /// `self` lies on the grid `min + k * step`
    fn on_step(&self, _min: &Self, _step: &Self) -> bool {
        true
    }

    /// Intersection of two closed ranges, if non-empty
    fn overlap(_a: (&Self, &Self), _b: (&Self, &Self)) -> Option<(Self, Self)> {
        None
    }
}

impl ChoiceValue for u32 {
    fn within(&self, min: &Self, max: &Self) -> bool {
        min <= self && self <= max
    }

    fn on_step(&self, min: &Self, step: &Self) -> bool {
        *step == 0 || (self - min) % step == 0
    }

    fn overlap(a: (&Self, &Self), b: (&Self, &Self)) -> Option<(Self, Self)> {
        let lo = *a.0.max(b.0);
        let hi = *a.1.min(b.1);
        (lo <= hi).then_some((lo, hi))
    }
}

impl ChoiceValue for Rectangle {
    fn within(&self, min: &Self, max: &Self) -> bool {
        self.width.within(&min.width, &max.width) && self.height.within(&min.height, &max.height)
    }

    fn on_step(&self, min: &Self, step: &Self) -> bool {
        self.width.on_step(&min.width, &step.width) && self.height.on_step(&min.height, &step.height)
    }

    fn overlap(a: (&Self, &Self), b: (&Self, &Self)) -> Option<(Self, Self)> {
        let (w_lo, w_hi) = u32::overlap((&a.0.width, &a.1.width), (&b.0.width, &b.1.width))?;
        let (h_lo, h_hi) = u32::overlap((&a.0.height, &a.1.height), (&b.0.height, &b.1.height))?;
        Some((Rectangle::new(w_lo, h_lo), Rectangle::new(w_hi, h_hi)))
    }
}

impl ChoiceValue for Fraction {
    fn within(&self, min: &Self, max: &Self) -> bool {
        self.cmp_value(min).is_ge() && self.cmp_value(max).is_le()
    }

    fn overlap(a: (&Self, &Self), b: (&Self, &Self)) -> Option<(Self, Self)> {
        let lo = if a.0.cmp_value(b.0).is_ge() { *a.0 } else { *b.0 };
        let hi = if a.1.cmp_value(b.1).is_le() { *a.1 } else { *b.1 };
        lo.cmp_value(&hi).is_le().then_some((lo, hi))
    }
}

// Enumerated types have no meaningful order; ranges over them only match
// their endpoints.
impl ChoiceValue for SampleFormat {
    fn within(&self, min: &Self, max: &Self) -> bool {
        self == min || self == max
    }
}

impl ChoiceValue for PixelFormat {
    fn within(&self, min: &Self, max: &Self) -> bool {
        self == min || self == max
    }
}

/// A property value: fixed, range, stepped range or enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Choice<T> {
    Fixed(T),
    Range { default: T, min: T, max: T },
    Step { default: T, min: T, max: T, step: T },
    Enum { default: T, alternatives: Vec<T> },
}

impl<T: ChoiceValue> Choice<T> {
    /// The preferred value
    pub fn default_value(&self) -> &T {
        match self {
            Choice::Fixed(v) => v,
            Choice::Range { default, .. }
            | Choice::Step { default, .. }
            | Choice::Enum { default, .. } => default,
        }
    }

    pub fn fixed_value(&self) -> Option<&T> {
        match self {
            Choice::Fixed(v) => Some(v),
            _ => None,
        }
    }

    /// Whether `value` is acceptable
    pub fn contains(&self, value: &T) -> bool {
        match self {
            Choice::Fixed(v) => v == value,
            Choice::Range { min, max, .. } => value.within(min, max),
            Choice::Step { min, max, step, .. } => value.within(min, max) && value.on_step(min, step),
            Choice::Enum { alternatives, .. } => alternatives.contains(value),
        }
    }

    /// Intersect with a peer's choice. `None` when nothing satisfies both.
    pub fn intersect(&self, other: &Choice<T>) -> Option<Choice<T>> {
        match (self, other) {
            (Choice::Fixed(v), o) => o.contains(v).then(|| Choice::Fixed(v.clone())),
            (s, Choice::Fixed(v)) => s.contains(v).then(|| Choice::Fixed(v.clone())),
            (Choice::Enum { default, alternatives }, o) => {
                Self::narrow_enum(default, alternatives, |v| o.contains(v))
            }
            (s, Choice::Enum { default, alternatives }) => {
                let own = s.default_value();
                let default = if alternatives.contains(own) { own } else { default };
                Self::narrow_enum(default, alternatives, |v| s.contains(v))
            }
            (a, b) => {
                let (a_min, a_max, a_step) = a.bounds()?;
                let (b_min, b_max, b_step) = b.bounds()?;
                let (min, max) = T::overlap((a_min, a_max), (b_min, b_max))?;
                let step = match (a_step, b_step) {
                    (Some(x), Some(y)) if x != y => return None,
                    (Some(x), _) | (_, Some(x)) => Some(x.clone()),
                    (None, None) => None,
                };
                let own = a.default_value();
                let default = if own.within(&min, &max) { own.clone() } else { min.clone() };
                if min == max {
                    return Some(Choice::Fixed(min));
                }
                Some(match step {
                    Some(step) => Choice::Step { default, min, max, step },
                    None => Choice::Range { default, min, max },
                })
            }
        }
    }

    fn bounds(&self) -> Option<(&T, &T, Option<&T>)> {
        match self {
            Choice::Range { min, max, .. } => Some((min, max, None)),
            Choice::Step { min, max, step, .. } => Some((min, max, Some(step))),
            _ => None,
        }
    }

    fn narrow_enum(default: &T, alternatives: &[T], keep: impl Fn(&T) -> bool) -> Option<Choice<T>> {
        let kept: Vec<T> = alternatives.iter().filter(|v| keep(v)).cloned().collect();
        match kept.len() {
            0 => None,
            1 => kept.into_iter().next().map(Choice::Fixed),
            _ => {
                let default = if kept.contains(default) { default.clone() } else { kept[0].clone() };
                Some(Choice::Enum { default, alternatives: kept })
            }
        }
    }
}

/// Key identifying a property in the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKey {
    SampleFormat,
    Channels,
    Rate,
    PixelFormat,
    Size,
    Framerate,
}

/// One entry of a format property list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormatProperty {
    SampleFormat(Choice<SampleFormat>),
    Channels(Choice<u32>),
    Rate(Choice<u32>),
    PixelFormat(Choice<PixelFormat>),
    Size(Choice<Rectangle>),
    Framerate(Choice<Fraction>),
}

impl FormatProperty {
    pub fn key(&self) -> PropertyKey {
        match self {
            FormatProperty::SampleFormat(_) => PropertyKey::SampleFormat,
            FormatProperty::Channels(_) => PropertyKey::Channels,
            FormatProperty::Rate(_) => PropertyKey::Rate,
            FormatProperty::PixelFormat(_) => PropertyKey::PixelFormat,
            FormatProperty::Size(_) => PropertyKey::Size,
            FormatProperty::Framerate(_) => PropertyKey::Framerate,
        }
    }

    fn intersect(&self, other: &FormatProperty) -> Option<FormatProperty> {
        use FormatProperty::*;
        match (self, other) {
            (SampleFormat(a), SampleFormat(b)) => a.intersect(b).map(SampleFormat),
            (Channels(a), Channels(b)) => a.intersect(b).map(Channels),
            (Rate(a), Rate(b)) => a.intersect(b).map(Rate),
            (PixelFormat(a), PixelFormat(b)) => a.intersect(b).map(PixelFormat),
            (Size(a), Size(b)) => a.intersect(b).map(Size),
            (Framerate(a), Framerate(b)) => a.intersect(b).map(Framerate),
            _ => None,
        }
    }
}

/// Ordered property list describing one or many formats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub media_type: MediaType,
    pub media_subtype: MediaSubtype,
    pub properties: Vec<FormatProperty>,
}

impl FormatDescriptor {
    pub fn new(media_type: MediaType, media_subtype: MediaSubtype) -> Self {
        FormatDescriptor {
            media_type,
            media_subtype,
            properties: Vec::new(),
        }
    }

    /// Builder-style property append
    pub fn with(mut self, property: FormatProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property(&self, key: PropertyKey) -> Option<&FormatProperty> {
        self.properties.iter().find(|p| p.key() == key)
    }

    /// Restrict this descriptor by a peer's filter.
    ///
    /// Properties the filter does not mention are kept as they are. Returns
    /// `None` when the media types differ or any shared property has an
    /// empty intersection.
    pub fn filter(&self, filter: Option<&FormatDescriptor>) -> Option<FormatDescriptor> {
        let Some(filter) = filter else {
            return Some(self.clone());
        };
        if self.media_type != filter.media_type || self.media_subtype != filter.media_subtype {
            return None;
        }

        let mut properties = Vec::with_capacity(self.properties.len());
        for property in &self.properties {
            match filter.property(property.key()) {
                Some(other) => properties.push(property.intersect(other)?),
                None => properties.push(property.clone()),
            }
        }

        Some(FormatDescriptor {
            media_type: self.media_type,
            media_subtype: self.media_subtype,
            properties,
        })
    }

    /// Whether a concrete format is one of the formats described here
    pub fn accepts(&self, format: &Format) -> bool {
        self.filter(Some(&format.to_descriptor())).is_some_and(|d| {
            // every property we constrain must have been given by the format
            d.properties.iter().all(|p| format.to_descriptor().property(p.key()).is_some())
        })
    }

    /// Pick the default of every property
    pub fn fixate(&self) -> EngineResult<Format> {
        let fixed = FormatDescriptor {
            media_type: self.media_type,
            media_subtype: self.media_subtype,
            properties: self
                .properties
                .iter()
                .map(|p| match p {
                    FormatProperty::SampleFormat(c) => FormatProperty::SampleFormat(Choice::Fixed(*c.default_value())),
                    FormatProperty::Channels(c) => FormatProperty::Channels(Choice::Fixed(*c.default_value())),
                    FormatProperty::Rate(c) => FormatProperty::Rate(Choice::Fixed(*c.default_value())),
                    FormatProperty::PixelFormat(c) => FormatProperty::PixelFormat(Choice::Fixed(*c.default_value())),
                    FormatProperty::Size(c) => FormatProperty::Size(Choice::Fixed(*c.default_value())),
                    FormatProperty::Framerate(c) => FormatProperty::Framerate(Choice::Fixed(*c.default_value())),
                })
                .collect(),
        };
        Format::parse(&fixed)
    }
}

/// Concrete raw audio format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
}

impl AudioInfo {
    /// Bytes per interleaved frame
    pub fn stride(&self) -> u32 {
        self.format.bytes_per_sample() * self.channels
    }
}

/// Concrete raw video format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub format: PixelFormat,
    pub size: Rectangle,
    pub framerate: Fraction,
}

/// A fully negotiated format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    Audio(AudioInfo),
    Video(VideoInfo),
}

impl Format {
    /// Parse a descriptor whose required properties are all fixed
    pub fn parse(descriptor: &FormatDescriptor) -> EngineResult<Format> {
        if descriptor.media_subtype != MediaSubtype::Raw {
            return Err(EngineError::InvalidFormat("only raw formats are supported".to_string()));
        }

        match descriptor.media_type {
            MediaType::Audio => Ok(Format::Audio(AudioInfo {
                format: fixed(descriptor, PropertyKey::SampleFormat, |p| match p {
                    FormatProperty::SampleFormat(c) => c.fixed_value().copied(),
                    _ => None,
                })?,
                channels: fixed(descriptor, PropertyKey::Channels, |p| match p {
                    FormatProperty::Channels(c) => c.fixed_value().copied(),
                    _ => None,
                })?,
                rate: fixed(descriptor, PropertyKey::Rate, |p| match p {
                    FormatProperty::Rate(c) => c.fixed_value().copied(),
                    _ => None,
                })?,
            })),
            MediaType::Video => Ok(Format::Video(VideoInfo {
                format: fixed(descriptor, PropertyKey::PixelFormat, |p| match p {
                    FormatProperty::PixelFormat(c) => c.fixed_value().copied(),
                    _ => None,
                })?,
                size: fixed(descriptor, PropertyKey::Size, |p| match p {
                    FormatProperty::Size(c) => c.fixed_value().copied(),
                    _ => None,
                })?,
                framerate: fixed(descriptor, PropertyKey::Framerate, |p| match p {
                    FormatProperty::Framerate(c) => c.fixed_value().copied(),
                    _ => None,
                })?,
            })),
        }
    }

    /// Express this format as an all-fixed descriptor
    pub fn to_descriptor(&self) -> FormatDescriptor {
        match self {
            Format::Audio(info) => FormatDescriptor::new(MediaType::Audio, MediaSubtype::Raw)
                .with(FormatProperty::SampleFormat(Choice::Fixed(info.format)))
                .with(FormatProperty::Channels(Choice::Fixed(info.channels)))
                .with(FormatProperty::Rate(Choice::Fixed(info.rate))),
            Format::Video(info) => FormatDescriptor::new(MediaType::Video, MediaSubtype::Raw)
                .with(FormatProperty::PixelFormat(Choice::Fixed(info.format)))
                .with(FormatProperty::Size(Choice::Fixed(info.size)))
                .with(FormatProperty::Framerate(Choice::Fixed(info.framerate))),
        }
    }

    pub fn audio(&self) -> Option<&AudioInfo> {
        match self {
            Format::Audio(info) => Some(info),
            Format::Video(_) => None,
        }
    }
}

fn fixed<T>(
    descriptor: &FormatDescriptor,
    key: PropertyKey,
    extract: impl Fn(&FormatProperty) -> Option<T>,
) -> EngineResult<T> {
    let property = descriptor
        .property(key)
        .ok_or_else(|| EngineError::InvalidFormat(format!("missing property {:?}", key)))?;
    extract(property).ok_or_else(|| EngineError::InvalidFormat(format!("property {:?} is not fixed", key)))
}
