// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary loader interface.
//!
//! Staging an image means copying its code into program memory and its
//! initialised data into data memory. The kernel does not care how; it only
//! needs the image's properties back.

use abi::{AppProperties, ImageHeader};

use crate::err::LoadError;

pub trait Loader {
    /// Stages `name` in full and reports its properties.
    fn load_image(&mut self, name: &str) -> Result<AppProperties, LoadError>;

    /// Stages the code of an image whose data memory is still live, e.g. to
    /// restore an application that was suspended while another ran.
    fn restage_image(&mut self, name: &str) -> Result<(), LoadError> {
        self.load_image(name).map(drop)
    }
}

/// Storage that image files can be read from.
pub trait ImageSource {
    /// Reads the first bytes of `name` into `buf`, returning how many were
    /// read.
    fn read_prefix(
        &mut self,
        name: &str,
        buf: &mut [u8],
    ) -> Result<usize, LoadError>;

    /// Copies the image's code, and its data if `with_data`, into place.
    fn stage(&mut self, name: &str, with_data: bool) -> Result<(), LoadError>;
}

/// A [`Loader`] for images that begin with an [`ImageHeader`].
pub struct HeaderLoader<S> {
    source: S,
}

impl<S: ImageSource> HeaderLoader<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn header(&mut self, name: &str) -> Result<ImageHeader, LoadError> {
        let mut buf = [0u8; ImageHeader::SIZE];
        let n = self.source.read_prefix(name, &mut buf)?;
        let header = ImageHeader::parse(&buf[..n])?;
        Ok(header)
    }
}

impl<S: ImageSource> Loader for HeaderLoader<S> {
    fn load_image(&mut self, name: &str) -> Result<AppProperties, LoadError> {
        let props = self.header(name)?.properties()?;
        self.source.stage(name, true)?;
        Ok(props)
    }

    fn restage_image(&mut self, name: &str) -> Result<(), LoadError> {
        self.header(name)?;
        self.source.stage(name, false)
    }
}
